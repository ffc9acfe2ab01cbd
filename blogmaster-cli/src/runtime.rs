//! Drives the [`App`] state machine: reads commands, runs effects against the
//! backend and prints the screen after every change.

use crate::{
    session::SessionStore,
    view::{App, Completion, Effect, ScopeId, Update, render::render, route::Route},
};
use blogmaster_common::{
    cache::{FeedEvent, Record},
    model::{auth::Session, comment::Comment, post::Post},
};
use blogmaster_db::{AuthBackend, ChangeFeed, Gateway, Subscription};
use futures::{
    FutureExt, StreamExt,
    future::LocalBoxFuture,
    stream::FuturesUnordered,
};
use std::{future::Future, io, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::{mpsc, watch},
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

pub const SESSION_CHECK_INTERVAL: Duration = Duration::from_secs(30);

struct CommentFeed {
    scope: ScopeId,
    subscription: Subscription<Comment>,
}

pub struct Runtime<G, A, F> {
    gateway: Arc<G>,
    sessions: SessionStore<A>,
    feed: F,
    app: App,
    pending: FuturesUnordered<LocalBoxFuture<'static, Option<Completion>>>,
    posts: Option<Subscription<Post>>,
    comments: Option<CommentFeed>,
    quit: bool,
}

async fn next_event<T: Record>(subscription: Option<&mut Subscription<T>>) -> Option<FeedEvent<T>> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

impl<G, A, F> Runtime<G, A, F>
where
    G: Gateway + 'static,
    A: AuthBackend + 'static,
    F: ChangeFeed,
{
    pub fn new(gateway: G, sessions: SessionStore<A>, feed: F, app: App) -> Self {
        Self {
            gateway: Arc::new(gateway),
            sessions,
            feed,
            app,
            pending: FuturesUnordered::new(),
            posts: None,
            comments: None,
            quit: false,
        }
    }

    /// Runs until `quit`, Ctrl-C, or the end of input once every pending
    /// request has finished.
    pub async fn run<W>(
        mut self,
        start: Route,
        mut input: mpsc::UnboundedReceiver<String>,
        mut output: W,
    ) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut session_changes = self.sessions.observe();
        self.feed
            .set_access_token(self.sessions.current().map(|session| session.access_token));

        let mut session_check = tokio::time::interval(SESSION_CHECK_INTERVAL);
        session_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let interrupted = tokio::signal::ctrl_c();
        tokio::pin!(interrupted);

        let update = self.app.start(start);
        self.apply(update, &mut output).await?;

        let mut input_open = true;
        while !self.quit && (input_open || !self.pending.is_empty()) {
            let update = tokio::select! {
                line = input.recv(), if input_open => match line {
                    Some(line) => self.on_line(&line),
                    None => {
                        debug!(pending = self.pending.len(), "Input closed");
                        input_open = false;
                        continue;
                    }
                },
                Some(completion) = self.pending.next(), if !self.pending.is_empty() => {
                    let Some(completion) = completion else {
                        continue;
                    };
                    // Signing in or out installs the session before completing.
                    let mut update = if session_changes.has_changed().unwrap_or(false) {
                        self.sync_session(&mut session_changes)
                    } else {
                        Update::default()
                    };
                    let completed = self.app.complete(completion);
                    update.effects.extend(completed.effects);
                    update.notices.extend(completed.notices);
                    update
                },
                event = next_event(self.posts.as_mut()) => match event {
                    Some(event) => self.app.post_event(event),
                    None => {
                        warn!("Post feed closed");
                        self.posts = None;
                        continue;
                    }
                },
                event = next_event(self.comments.as_mut().map(|feed| &mut feed.subscription)) => {
                    match (event, self.comments.as_ref().map(|feed| feed.scope)) {
                        (Some(event), Some(scope)) => self.app.comment_event(scope, event),
                        _ => {
                            warn!("Comment feed closed");
                            self.comments = None;
                            continue;
                        }
                    }
                },
                changed = session_changes.changed() => {
                    if changed.is_err() {
                        continue;
                    }
                    self.sync_session(&mut session_changes)
                },
                _ = session_check.tick(), if input_open => {
                    let sessions = self.sessions.clone();
                    self.spawn(async move {
                        sessions.refresh_if_needed().await;
                        None
                    });
                    continue;
                },
                result = &mut interrupted => {
                    if let Err(err) = result {
                        warn!(%err, "Listening for Ctrl-C failed");
                    }
                    info!("Interrupted");
                    break;
                },
            };

            self.apply(update, &mut output).await?;
        }

        Ok(())
    }

    fn sync_session(&mut self, changes: &mut watch::Receiver<Option<Session>>) -> Update {
        let session = changes.borrow_and_update().clone();
        debug!(signed_in = session.is_some(), "Session changed");
        self.feed
            .set_access_token(session.as_ref().map(|session| session.access_token.clone()));
        self.app.session_changed(session)
    }

    fn on_line(&mut self, line: &str) -> Update {
        let line = line.trim();
        if line.is_empty() {
            return Update::default();
        }

        match line.parse() {
            Ok(command) => {
                debug!(?command, "Command");
                self.app.handle(command)
            }
            Err(err) => App::reject(err),
        }
    }

    fn spawn(&self, future: impl Future<Output = Option<Completion>> + 'static) {
        self.pending.push(future.boxed_local());
    }

    fn execute(&mut self, effect: Effect) {
        debug!(?effect, "Effect");
        let gateway = Arc::clone(&self.gateway);

        match effect {
            Effect::SubscribePosts => self.posts = Some(self.feed.subscribe_posts()),
            Effect::LoadPosts => {
                let session = self.sessions.current();
                self.spawn(async move {
                    Some(Completion::PostsLoaded(
                        gateway.list_posts(session.as_ref()).await,
                    ))
                });
            }
            Effect::SubscribeComments { scope, post_id } => {
                self.comments = Some(CommentFeed {
                    scope,
                    subscription: self.feed.subscribe_comments(post_id),
                });
            }
            Effect::LoadComments { scope, post_id } => {
                let session = self.sessions.current();
                self.spawn(async move {
                    let result = gateway.list_comments(session.as_ref(), post_id).await;
                    Some(Completion::CommentsLoaded { scope, result })
                });
            }
            Effect::UnsubscribeComments => self.comments = None,
            Effect::CreatePost { session, post } => self.spawn(async move {
                Some(Completion::PostCreated(
                    gateway.create_post(&session, &post).await,
                ))
            }),
            Effect::DeletePost { session, id } => self.spawn(async move {
                let result = gateway.delete_post(&session, id).await;
                Some(Completion::PostDeleted { id, result })
            }),
            Effect::CreateComment {
                scope,
                session,
                comment,
            } => self.spawn(async move {
                let result = gateway.create_comment(&session, &comment).await;
                Some(Completion::CommentCreated { scope, result })
            }),
            Effect::DeleteComment { session, id } => self.spawn(async move {
                Some(Completion::CommentDeleted(
                    gateway.delete_comment(&session, id).await,
                ))
            }),
            Effect::LoadStats => {
                let session = self.sessions.current();
                self.spawn(async move {
                    Some(Completion::StatsLoaded(
                        gateway.fetch_stats(session.as_ref()).await,
                    ))
                });
            }
            Effect::SignIn(credentials) => {
                let sessions = self.sessions.clone();
                self.spawn(async move {
                    let result = sessions.sign_in(&credentials).await.map(|_| ());
                    Some(Completion::SignedIn(result))
                });
            }
            Effect::SignUp(credentials) => {
                let sessions = self.sessions.clone();
                self.spawn(async move {
                    Some(Completion::SignedUp(sessions.sign_up(&credentials).await))
                });
            }
            Effect::SignOut => {
                let sessions = self.sessions.clone();
                self.spawn(async move {
                    sessions.sign_out().await;
                    Some(Completion::SignedOut)
                });
            }
            Effect::Quit => self.quit = true,
        }
    }

    async fn apply<W>(&mut self, update: Update, output: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let Update { effects, notices } = update;
        for effect in effects {
            self.execute(effect);
        }

        let mut screen = String::new();
        for notice in notices {
            screen.push_str(&format!("! {notice}\n"));
        }
        screen.push_str(&render(&self.app));
        screen.push_str("> ");

        output.write_all(screen.as_bytes()).await?;
        output.flush().await
    }
}
