//! The view layer as a synchronous state machine.
//!
//! [`App`] never performs IO itself. Commands, request completions, feed
//! events and session changes go in, and every call answers with an
//! [`Update`]: the [`Effect`]s the runtime has to carry out and the
//! [`Notice`]s to show to the user.

pub mod command;
pub mod render;
pub mod route;

use crate::view::{
    command::{Command, CommandParseError},
    route::{Route, RouteParseError},
};
use blogmaster_common::{
    cache::{Change, FeedEvent, SortOrder, SyncedList},
    model::{
        ModelValidationError,
        auth::{AdminDomain, Authorization, Credentials, Identity, Session},
        comment::{Comment, CommentContent, CommentId, NewComment},
        post::{NewPost, Post, PostContent, PostId},
        stats::Stats,
    },
};
use blogmaster_db::{RemoteError, SignUpOutcome};
use tracing::{debug, warn};

/// Identifies one selection of the detail view.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Hash)]
pub struct ScopeId(u64);

#[derive(Clone, Eq, PartialEq, Debug)]
pub enum Effect {
    SubscribePosts,
    LoadPosts,
    SubscribeComments {
        scope: ScopeId,
        post_id: PostId,
    },
    LoadComments {
        scope: ScopeId,
        post_id: PostId,
    },
    UnsubscribeComments,
    CreatePost {
        session: Session,
        post: NewPost,
    },
    DeletePost {
        session: Session,
        id: PostId,
    },
    CreateComment {
        scope: ScopeId,
        session: Session,
        comment: NewComment,
    },
    DeleteComment {
        session: Session,
        id: CommentId,
    },
    LoadStats,
    SignIn(Credentials),
    SignUp(Credentials),
    SignOut,
    Quit,
}

/// Result of an [`Effect`] that went to the backend.
#[derive(Debug)]
pub enum Completion {
    PostsLoaded(Result<Vec<Post>, RemoteError>),
    CommentsLoaded {
        scope: ScopeId,
        result: Result<Vec<Comment>, RemoteError>,
    },
    PostCreated(Result<(), RemoteError>),
    PostDeleted {
        id: PostId,
        result: Result<(), RemoteError>,
    },
    CommentCreated {
        scope: ScopeId,
        result: Result<(), RemoteError>,
    },
    CommentDeleted(Result<(), RemoteError>),
    StatsLoaded(Result<Stats, RemoteError>),
    SignedIn(Result<(), RemoteError>),
    SignedUp(Result<SignUpOutcome, RemoteError>),
    SignedOut,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum Action {
    Publish,
    Comment,
    DeletePost,
    DeleteComment,
    SignIn,
    SignUp,
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub enum Notice {
    MustSignIn,
    AdminOnly,
    NoPostOpen,
    InProgress,
    InvalidDraft(ModelValidationError),
    InvalidCommand(CommandParseError),
    InvalidLocation(RouteParseError),
    Failed { action: Action, message: String },
    Published,
    CommentSent,
    PostDeleted,
    CommentDeleted,
    SignedIn,
    SignedOut,
    ConfirmEmail,
    Help,
}

#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct Update {
    pub effects: Vec<Effect>,
    pub notices: Vec<Notice>,
}

impl Update {
    fn effect(effect: Effect) -> Self {
        Self {
            effects: vec![effect],
            notices: Vec::new(),
        }
    }

    fn notice(notice: Notice) -> Self {
        Self {
            effects: Vec::new(),
            notices: vec![notice],
        }
    }

    fn with_notice(mut self, notice: Notice) -> Self {
        self.notices.push(notice);
        self
    }
}

#[derive(Clone, Eq, PartialEq, Debug, Default, Hash)]
pub struct PostDraft {
    pub title: String,
    pub body: String,
}

/// The open detail view of one post.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Detail {
    scope: ScopeId,
    post_id: PostId,
    comments: SyncedList<Comment>,
    draft: String,
    sending: bool,
}

impl Detail {
    #[must_use]
    pub fn comments(&self) -> &SyncedList<Comment> {
        &self.comments
    }

    #[must_use]
    pub fn draft(&self) -> &str {
        &self.draft
    }
}

#[derive(Clone, PartialEq, Debug)]
pub enum StatsView {
    Loading,
    Loaded(Stats),
    Failed(String),
}

#[derive(Clone, PartialEq, Debug)]
pub struct App {
    admin_domain: AdminDomain,
    session: Option<Session>,
    identity: Option<Identity>,
    route: Route,
    posts: SyncedList<Post>,
    detail: Option<Detail>,
    post_draft: PostDraft,
    publishing: bool,
    stats: Option<StatsView>,
    next_scope: u64,
}

impl App {
    #[must_use]
    pub fn new(admin_domain: AdminDomain, session: Option<Session>) -> Self {
        let identity = session
            .as_ref()
            .map(|session| Identity::from_session(session, &admin_domain));

        Self {
            admin_domain,
            session,
            identity,
            route: Route::Home,
            posts: SyncedList::new(SortOrder::NewestFirst),
            detail: None,
            post_draft: PostDraft::default(),
            publishing: false,
            stats: None,
            next_scope: 0,
        }
    }

    /// Mounts the post list, then opens `route`.
    pub fn start(&mut self, route: Route) -> Update {
        let mut update = Update {
            effects: vec![Effect::SubscribePosts, Effect::LoadPosts],
            notices: Vec::new(),
        };
        update.effects.extend(self.navigate(route));
        update
    }

    #[must_use]
    pub fn route(&self) -> Route {
        self.route
    }

    #[must_use]
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    #[must_use]
    pub fn authorization(&self) -> Authorization {
        Authorization::of(self.identity.as_ref())
    }

    #[must_use]
    pub fn posts(&self) -> &SyncedList<Post> {
        &self.posts
    }

    #[must_use]
    pub fn detail(&self) -> Option<&Detail> {
        self.detail.as_ref()
    }

    /// The post the detail view points at, if it is in the local cache.
    #[must_use]
    pub fn selected_post(&self) -> Option<&Post> {
        let detail = self.detail.as_ref()?;
        self.posts.list().get(detail.post_id)
    }

    #[must_use]
    pub fn post_draft(&self) -> &PostDraft {
        &self.post_draft
    }

    #[must_use]
    pub fn stats(&self) -> Option<&StatsView> {
        self.stats.as_ref()
    }

    fn navigate(&mut self, route: Route) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.route = route;

        match route {
            Route::Post(post_id) => {
                if self.detail.as_ref().is_some_and(|detail| detail.post_id == post_id) {
                    return effects;
                }

                self.next_scope += 1;
                let scope = ScopeId(self.next_scope);
                self.detail = Some(Detail {
                    scope,
                    post_id,
                    comments: SyncedList::new(SortOrder::OldestFirst),
                    draft: String::new(),
                    sending: false,
                });
                effects.push(Effect::SubscribeComments { scope, post_id });
                effects.push(Effect::LoadComments { scope, post_id });
            }
            _ => {
                if self.detail.take().is_some() {
                    effects.push(Effect::UnsubscribeComments);
                }
            }
        }

        if route == Route::Stats {
            self.stats = Some(StatsView::Loading);
            effects.push(Effect::LoadStats);
        } else {
            self.stats = None;
        }

        effects
    }

    pub fn handle(&mut self, command: Command) -> Update {
        match command {
            Command::Open(post_id) => self.go(Route::Post(post_id)),
            Command::Go(route) => self.go(route),
            Command::Home => self.go(Route::Home),
            Command::Stats => self.go(Route::Stats),
            Command::Auth => self.go(Route::Auth),
            Command::Login(credentials) => Update::effect(Effect::SignIn(credentials)),
            Command::SignUp(credentials) => Update::effect(Effect::SignUp(credentials)),
            Command::Logout => match self.session {
                Some(_) => Update::effect(Effect::SignOut),
                None => Update::notice(Notice::MustSignIn),
            },
            Command::Title(title) => {
                self.post_draft.title = title;
                Update::default()
            }
            Command::Body(body) => {
                self.post_draft.body = body;
                Update::default()
            }
            Command::Publish => self.publish(),
            Command::Comment(text) => match &mut self.detail {
                Some(detail) => {
                    detail.draft = text;
                    Update::default()
                }
                None => Update::notice(Notice::NoPostOpen),
            },
            Command::Send => self.send_comment(),
            Command::DeletePost(id) => self
                .admin_session()
                .map_or_else(Update::notice, |session| {
                    Update::effect(Effect::DeletePost { session, id })
                }),
            Command::DeleteComment(id) => self
                .admin_session()
                .map_or_else(Update::notice, |session| {
                    Update::effect(Effect::DeleteComment { session, id })
                }),
            Command::Refresh => self.reload(),
            Command::Help => Update::notice(Notice::Help),
            Command::Quit => Update::effect(Effect::Quit),
        }
    }

    /// Reports a line that did not parse as a command.
    #[must_use]
    pub fn reject(error: CommandParseError) -> Update {
        match error {
            CommandParseError::Route(error) => Update::notice(Notice::InvalidLocation(error)),
            error => Update::notice(Notice::InvalidCommand(error)),
        }
    }

    fn go(&mut self, route: Route) -> Update {
        Update {
            effects: self.navigate(route),
            notices: Vec::new(),
        }
    }

    fn admin_session(&self) -> Result<Session, Notice> {
        let (Some(session), Some(identity)) = (&self.session, &self.identity) else {
            return Err(Notice::MustSignIn);
        };
        if !identity.is_admin() {
            return Err(Notice::AdminOnly);
        }

        Ok(session.clone())
    }

    fn publish(&mut self) -> Update {
        let Some(session) = self.session.clone() else {
            return Update::notice(Notice::MustSignIn);
        };
        if self.publishing {
            return Update::notice(Notice::InProgress);
        }

        match PostContent::new(&self.post_draft.title, &self.post_draft.body) {
            Ok(content) => {
                self.publishing = true;
                Update::effect(Effect::CreatePost {
                    post: NewPost {
                        user_id: session.user.id,
                        content,
                    },
                    session,
                })
            }
            Err(err) => Update::notice(Notice::InvalidDraft(err.into())),
        }
    }

    fn send_comment(&mut self) -> Update {
        let Some(detail) = &mut self.detail else {
            return Update::notice(Notice::NoPostOpen);
        };
        let Some(session) = &self.session else {
            return Update::notice(Notice::MustSignIn);
        };
        if detail.sending {
            return Update::notice(Notice::InProgress);
        }

        match CommentContent::new(&detail.draft) {
            Ok(content) => {
                detail.sending = true;
                Update::effect(Effect::CreateComment {
                    scope: detail.scope,
                    session: session.clone(),
                    comment: NewComment {
                        post_id: detail.post_id,
                        user_id: session.user.id,
                        content,
                    },
                })
            }
            Err(err) => Update::notice(Notice::InvalidDraft(err.into())),
        }
    }

    fn reload_posts(&mut self) -> Effect {
        self.posts.begin_load();
        Effect::LoadPosts
    }

    fn reload(&mut self) -> Update {
        let mut update = Update::effect(self.reload_posts());

        if let Some(detail) = &mut self.detail {
            detail.comments.begin_load();
            update.effects.push(Effect::LoadComments {
                scope: detail.scope,
                post_id: detail.post_id,
            });
        }
        if self.stats.is_some() {
            self.stats = Some(StatsView::Loading);
            update.effects.push(Effect::LoadStats);
        }

        update
    }

    fn detail_in_scope(&mut self, scope: ScopeId) -> Option<&mut Detail> {
        self.detail.as_mut().filter(|detail| detail.scope == scope)
    }

    pub fn complete(&mut self, completion: Completion) -> Update {
        match completion {
            Completion::PostsLoaded(Ok(posts)) => {
                self.posts.finish_load(posts);
                Update::default()
            }
            Completion::PostsLoaded(Err(err)) => {
                warn!(%err, "Loading posts failed");
                self.posts.fail_load(err.to_string());
                Update::default()
            }
            Completion::CommentsLoaded { scope, result } => {
                let Some(detail) = self.detail_in_scope(scope) else {
                    debug!(?scope, "Discarding comments of a closed post");
                    return Update::default();
                };
                match result {
                    Ok(comments) => detail.comments.finish_load(comments),
                    Err(err) => {
                        warn!(%err, post_id = %detail.post_id, "Loading comments failed");
                        detail.comments.fail_load(err.to_string());
                    }
                }
                Update::default()
            }
            Completion::PostCreated(result) => {
                self.publishing = false;
                match result {
                    Ok(()) => {
                        self.post_draft = PostDraft::default();
                        Update::notice(Notice::Published)
                    }
                    Err(err) => failed(Action::Publish, &err),
                }
            }
            Completion::PostDeleted { id, result } => match result {
                Ok(()) => {
                    let mut update = Update::notice(Notice::PostDeleted);
                    if self.route == Route::Post(id) {
                        update.effects = self.navigate(Route::Home);
                    }
                    update
                }
                Err(err) => failed(Action::DeletePost, &err),
            },
            Completion::CommentCreated { scope, result } => {
                if let Some(detail) = self.detail_in_scope(scope) {
                    detail.sending = false;
                    if result.is_ok() {
                        detail.draft.clear();
                    }
                }
                match result {
                    Ok(()) => Update::notice(Notice::CommentSent),
                    Err(err) => failed(Action::Comment, &err),
                }
            }
            Completion::CommentDeleted(result) => match result {
                Ok(()) => Update::notice(Notice::CommentDeleted),
                Err(err) => failed(Action::DeleteComment, &err),
            },
            Completion::StatsLoaded(result) => {
                if self.stats.is_none() {
                    return Update::default();
                }
                self.stats = Some(match result {
                    Ok(stats) => StatsView::Loaded(stats),
                    Err(err) => {
                        warn!(%err, "Loading statistics failed");
                        StatsView::Failed(err.to_string())
                    }
                });
                Update::default()
            }
            Completion::SignedIn(result) => match result {
                Ok(()) => self.go(Route::Home).with_notice(Notice::SignedIn),
                Err(err) => failed(Action::SignIn, &err),
            },
            Completion::SignedUp(result) => match result {
                Ok(SignUpOutcome::SignedIn(_)) => self.go(Route::Home).with_notice(Notice::SignedIn),
                Ok(SignUpOutcome::ConfirmationRequired) => Update::notice(Notice::ConfirmEmail),
                Err(err) => failed(Action::SignUp, &err),
            },
            Completion::SignedOut => Update::notice(Notice::SignedOut),
        }
    }

    pub fn post_event(&mut self, event: FeedEvent<Post>) -> Update {
        match event {
            FeedEvent::Change(change) => {
                if let Change::Delete(id) = &change {
                    debug!(%id, "Post deleted");
                }
                self.posts.apply(change);
                Update::default()
            }
            FeedEvent::Lagged => {
                debug!("Post feed lagged, reloading");
                Update::effect(self.reload_posts())
            }
        }
    }

    pub fn comment_event(&mut self, scope: ScopeId, event: FeedEvent<Comment>) -> Update {
        let Some(detail) = self.detail_in_scope(scope) else {
            debug!(?scope, "Discarding comment event of a closed post");
            return Update::default();
        };

        match event {
            FeedEvent::Change(change) => {
                detail.comments.apply(change);
                Update::default()
            }
            FeedEvent::Lagged => {
                debug!(post_id = %detail.post_id, "Comment feed lagged, reloading");
                detail.comments.begin_load();
                Update::effect(Effect::LoadComments {
                    scope,
                    post_id: detail.post_id,
                })
            }
        }
    }

    pub fn session_changed(&mut self, session: Option<Session>) -> Update {
        self.identity = session
            .as_ref()
            .map(|session| Identity::from_session(session, &self.admin_domain));
        self.session = session;
        Update::default()
    }
}

fn failed(action: Action, err: &RemoteError) -> Update {
    warn!(%err, ?action, "Request failed");
    Update::notice(Notice::Failed {
        action,
        message: err.to_string(),
    })
}
