use crate::view::{Action, App, Notice, StatsView, command::HELP, route::Route};
use blogmaster_common::{
    cache::{LoadState, SyncedList},
    model::{comment::Comment, post::Post},
    util::excerpt,
};
use std::fmt::{Display, Formatter, Result};
use time::{OffsetDateTime, macros::format_description};

pub const EXCERPT_CHARS: usize = 200;

#[must_use]
pub fn timestamp(at: OffsetDateTime) -> String {
    at.format(format_description!(
        "[day]/[month]/[year] [hour]:[minute]:[second]"
    ))
    .unwrap_or_else(|_| at.to_string())
}

/// Text rendition of the whole screen.
#[must_use]
pub fn render(app: &App) -> String {
    Screen(app).to_string()
}

struct Screen<'a>(&'a App);

impl Display for Screen<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        let app = self.0;

        write!(f, "==== BlogMaster ====")?;
        match app.identity() {
            Some(identity) => {
                let who = identity.email.as_deref().unwrap_or("unknown user");
                write!(f, "  signed in as {who}")?;
                if identity.is_admin() {
                    write!(f, " [admin]")?;
                }
                writeln!(f)?;
            }
            None => writeln!(f, "  not signed in")?,
        }
        writeln!(f, "---- {} ----", app.route())?;

        match app.route() {
            Route::Home => home(f, app),
            Route::Post(_) => detail(f, app),
            Route::Stats => stats(f, app),
            Route::Auth => auth(f, app),
        }
    }
}

fn load_state<T>(f: &mut Formatter<'_>, list: &SyncedList<T>, what: &str) -> Result
where
    T: blogmaster_common::cache::Record + Clone,
{
    match list.state() {
        LoadState::Loading if list.list().is_empty() => writeln!(f, "Loading {what}…"),
        LoadState::Failed(message) => writeln!(f, "Could not load {what}: {message}"),
        _ if list.list().is_empty() => writeln!(f, "No {what} yet."),
        _ => Ok(()),
    }
}

fn post_entry(f: &mut Formatter<'_>, post: &Post) -> Result {
    writeln!(f)?;
    writeln!(f, "{}  ({})", post.title, timestamp(post.created_at))?;
    writeln!(f, "  {}", excerpt(&post.content, EXCERPT_CHARS))?;
    writeln!(f, "  open {}", post.id)
}

fn home(f: &mut Formatter<'_>, app: &App) -> Result {
    load_state(f, app.posts(), "posts")?;
    for post in app.posts().list() {
        post_entry(f, post)?;
    }

    writeln!(f)?;
    if app.identity().is_some() {
        let draft = app.post_draft();
        writeln!(f, "New post (`title`, `body`, then `publish`)")?;
        writeln!(f, "  title: {}", draft.title)?;
        writeln!(f, "  body:  {}", draft.body)
    } else {
        writeln!(f, "Sign in (`auth`) to write posts.")
    }
}

fn comment_entry(f: &mut Formatter<'_>, comment: &Comment, admin: bool) -> Result {
    write!(f, "- {}  {}", timestamp(comment.created_at), comment.content)?;
    if admin {
        write!(f, "  [delete comment {}]", comment.id)?;
    }
    writeln!(f)
}

fn detail(f: &mut Formatter<'_>, app: &App) -> Result {
    let Some(detail) = app.detail() else {
        return Ok(());
    };
    let admin = app.authorization().is_elevated();

    match app.selected_post() {
        Some(post) => {
            writeln!(f, "{}", post.title)?;
            writeln!(f, "{}", timestamp(post.created_at))?;
            writeln!(f)?;
            writeln!(f, "{}", post.content)?;
            if admin {
                writeln!(f, "[delete post {}]", post.id)?;
            }
        }
        None if app.posts().is_loading() => writeln!(f, "Loading post…")?,
        None => writeln!(f, "Post not found.")?,
    }

    writeln!(f)?;
    writeln!(f, "Comments ({})", detail.comments().list().len())?;
    load_state(f, detail.comments(), "comments")?;
    for comment in detail.comments().list() {
        comment_entry(f, comment, admin)?;
    }

    writeln!(f)?;
    if app.identity().is_some() {
        writeln!(f, "Your comment (`comment`, then `send`): {}", detail.draft())
    } else {
        writeln!(f, "Sign in (`auth`) to comment.")
    }
}

fn stats(f: &mut Formatter<'_>, app: &App) -> Result {
    match app.stats() {
        None | Some(StatsView::Loading) => writeln!(f, "Loading statistics…"),
        Some(StatsView::Failed(message)) => writeln!(f, "Could not load statistics: {message}"),
        Some(StatsView::Loaded(stats)) => {
            writeln!(f, "Total posts:               {}", stats.total_posts)?;
            writeln!(
                f,
                "Average comments per post: {:.2}",
                stats.avg_comments_per_post
            )?;
            writeln!(f, "Average posts per user:    {:.2}", stats.avg_posts_per_user)
        }
    }
}

fn auth(f: &mut Formatter<'_>, app: &App) -> Result {
    match app.identity() {
        Some(_) => writeln!(f, "You are signed in. Type `logout` to sign out."),
        None => {
            writeln!(f, "Sign in:         login <email> <password>")?;
            writeln!(f, "Create account:  signup <email> <password>")
        }
    }
}

impl Display for Action {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        f.write_str(match self {
            Self::Publish => "Publishing the post",
            Self::Comment => "Sending the comment",
            Self::DeletePost => "Deleting the post",
            Self::DeleteComment => "Deleting the comment",
            Self::SignIn => "Signing in",
            Self::SignUp => "Signing up",
        })
    }
}

impl Display for Notice {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        match self {
            Self::MustSignIn => write!(f, "You need to sign in first (see `auth`)."),
            Self::AdminOnly => write!(f, "Only administrators can delete."),
            Self::NoPostOpen => write!(f, "Open a post first."),
            Self::InProgress => write!(f, "Still waiting for the previous request."),
            Self::InvalidDraft(err) => write!(f, "{err}."),
            Self::InvalidCommand(err) => write!(f, "{err}"),
            Self::InvalidLocation(err) => write!(f, "{err}"),
            Self::Failed { action, message } => write!(f, "{action} failed: {message}"),
            Self::Published => write!(f, "Post published."),
            Self::CommentSent => write!(f, "Comment sent."),
            Self::PostDeleted => write!(f, "Post deleted."),
            Self::CommentDeleted => write!(f, "Comment deleted."),
            Self::SignedIn => write!(f, "Signed in."),
            Self::SignedOut => write!(f, "Signed out."),
            Self::ConfirmEmail => write!(
                f,
                "Account created. Confirm your email address, then sign in."
            ),
            Self::Help => write!(f, "{HELP}"),
        }
    }
}
