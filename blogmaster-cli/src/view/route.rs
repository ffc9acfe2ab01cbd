use blogmaster_common::model::{InvalidIdError, post::PostId};
use std::{fmt::Display, str::FromStr};
use thiserror::Error;
use url::Url;

/// Locations are resolved against this, so both paths and full URLs work.
const BASE: &str = "blogmaster://app/";

#[derive(Copy, Clone, Eq, PartialEq, Debug, Default, Hash)]
pub enum Route {
    #[default]
    Home,
    Post(PostId),
    Stats,
    Auth,
}

#[derive(Clone, Eq, PartialEq, Debug, Error)]
pub enum RouteParseError {
    #[error("Not a valid location: {0}")]
    Url(#[from] url::ParseError),
    #[error("There is no page at {0}")]
    UnknownPath(String),
    #[error("Invalid post parameter: {0}")]
    InvalidPost(#[from] InvalidIdError),
}

impl FromStr for Route {
    type Err = RouteParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let location = Url::parse(BASE)?.join(s.trim())?;

        match location.path().trim_end_matches('/') {
            "" => {
                // An empty `post` parameter selects nothing.
                let post = location
                    .query_pairs()
                    .find_map(|(key, value)| (key == "post").then_some(value))
                    .filter(|id| !id.is_empty());
                match post {
                    Some(id) => Ok(Self::Post(id.parse()?)),
                    None => Ok(Self::Home),
                }
            }
            "/stats" => Ok(Self::Stats),
            "/auth" => Ok(Self::Auth),
            other => Err(RouteParseError::UnknownPath(other.to_owned())),
        }
    }
}

impl Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Home => write!(f, "/"),
            Self::Post(id) => write!(f, "/?post={id}"),
            Self::Stats => write!(f, "/stats"),
            Self::Auth => write!(f, "/auth"),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::view::route::{Route, RouteParseError};
    use blogmaster_common::model::Id;
    use uuid::Uuid;

    #[test]
    fn parses_locations() {
        let id = Uuid::new_v4();

        assert_eq!("/".parse(), Ok(Route::Home));
        assert_eq!("".parse(), Ok(Route::Home));
        assert_eq!("/stats".parse(), Ok(Route::Stats));
        assert_eq!("/auth/".parse(), Ok(Route::Auth));
        assert_eq!("/?post=".parse(), Ok(Route::Home));
        assert_eq!("?post".parse(), Ok(Route::Home));
        assert_eq!(format!("/?post={id}").parse(), Ok(Route::Post(Id::new(id))));
        assert_eq!(format!("?post={id}").parse(), Ok(Route::Post(Id::new(id))));
        assert_eq!(
            format!("https://blog.example.com/?post={id}&utm=x").parse(),
            Ok(Route::Post(Id::new(id)))
        );
    }

    #[test]
    fn rejects_bad_locations() {
        assert!(matches!(
            "/?post=not-a-uuid".parse::<Route>(),
            Err(RouteParseError::InvalidPost(_))
        ));
        assert_eq!(
            "/admin".parse::<Route>(),
            Err(RouteParseError::UnknownPath("/admin".to_owned()))
        );
    }

    #[test]
    fn display_round_trips() {
        let route = Route::Post(Id::new(Uuid::new_v4()));
        assert_eq!(route.to_string().parse(), Ok(route));
    }
}
