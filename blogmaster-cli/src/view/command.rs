use crate::view::route::{Route, RouteParseError};
use blogmaster_common::model::{
    InvalidIdError, auth::Credentials, comment::CommentId, post::PostId,
};
use std::str::FromStr;
use thiserror::Error;

pub const HELP: &str = "\
Navigation:
  open <post id>              show a post and its comments
  go <location>               e.g. /, /?post=<id>, /stats, /auth
  home | back                 list of posts
  stats                       site statistics
  auth                        sign-in page
Account:
  login <email> <password>
  signup <email> <password>
  logout
Writing:
  title <text>                set the title of the new post
  body <text>                 set the text of the new post
  publish                     publish the new post
  comment <text>              set the comment for the open post
  send                        send the comment
Administration:
  delete post <id>
  delete comment <id>
Other:
  refresh                     reload what is on screen
  help
  quit";

#[derive(Clone, Eq, PartialEq, Debug)]
pub enum Command {
    Open(PostId),
    Go(Route),
    Home,
    Stats,
    Auth,
    Login(Credentials),
    SignUp(Credentials),
    Logout,
    Title(String),
    Body(String),
    Publish,
    Comment(String),
    Send,
    DeletePost(PostId),
    DeleteComment(CommentId),
    Refresh,
    Help,
    Quit,
}

#[derive(Clone, Eq, PartialEq, Debug, Error)]
pub enum CommandParseError {
    #[error("Unknown command `{0}`, type `help` for a list")]
    Unknown(String),
    #[error("Usage: {0}")]
    Usage(&'static str),
    #[error(transparent)]
    Id(#[from] InvalidIdError),
    #[error(transparent)]
    Route(#[from] RouteParseError),
}

fn credentials(rest: &str, usage: &'static str) -> Result<Credentials, CommandParseError> {
    let mut parts = rest.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(email), Some(password), None) => Ok(Credentials {
            email: email.to_owned(),
            password: password.to_owned(),
        }),
        _ => Err(CommandParseError::Usage(usage)),
    }
}

fn no_arguments(command: Command, rest: &str, usage: &'static str) -> Result<Command, CommandParseError> {
    if rest.is_empty() {
        Ok(command)
    } else {
        Err(CommandParseError::Usage(usage))
    }
}

impl FromStr for Command {
    type Err = CommandParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let line = s.trim();
        let (word, rest) = line
            .split_once(char::is_whitespace)
            .map_or((line, ""), |(word, rest)| (word, rest.trim()));

        match word.to_lowercase().as_str() {
            "open" if !rest.is_empty() => Ok(Self::Open(rest.parse()?)),
            "open" => Err(CommandParseError::Usage("open <post id>")),
            "go" => Ok(Self::Go(rest.parse()?)),
            "home" | "back" => no_arguments(Self::Home, rest, "home"),
            "stats" => no_arguments(Self::Stats, rest, "stats"),
            "auth" => no_arguments(Self::Auth, rest, "auth"),
            "login" => Ok(Self::Login(credentials(rest, "login <email> <password>")?)),
            "signup" => Ok(Self::SignUp(credentials(rest, "signup <email> <password>")?)),
            "logout" => no_arguments(Self::Logout, rest, "logout"),
            "title" => Ok(Self::Title(rest.to_owned())),
            "body" => Ok(Self::Body(rest.to_owned())),
            "publish" => no_arguments(Self::Publish, rest, "publish"),
            "comment" => Ok(Self::Comment(rest.to_owned())),
            "send" => no_arguments(Self::Send, rest, "send"),
            "delete" => match rest.split_once(char::is_whitespace) {
                Some(("post", id)) => Ok(Self::DeletePost(id.parse()?)),
                Some(("comment", id)) => Ok(Self::DeleteComment(id.parse()?)),
                _ => Err(CommandParseError::Usage("delete post <id> | delete comment <id>")),
            },
            "refresh" => no_arguments(Self::Refresh, rest, "refresh"),
            "help" | "?" => Ok(Self::Help),
            "quit" | "exit" => no_arguments(Self::Quit, rest, "quit"),
            _ => Err(CommandParseError::Unknown(word.to_owned())),
        }
    }
}
