// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! User authentication, RFC 4252. The server side runs ordered method
//! chains: the configuration is a disjunction of conjunctions, every
//! method of some chain has to pass before the session counts as
//! authenticated.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};

use crate::{msg, Buffer, Config, Disconnect, Error, Promise, Service, SessionHandle};

pub mod authorized_keys;

mod client;
mod methods;

pub use client::{ClientMethod, ClientUserAuth, Signer};
pub use methods::{default_factories, Authenticator, InteractiveChallenge};

#[cfg(test)]
pub(crate) use methods::signed_auth_blob;

/// Everything a method implementation may need mid-exchange.
pub struct AuthCtx<'a> {
    pub session: &'a SessionHandle,
    /// Session identifier from the transport's first key exchange;
    /// public-key signatures cover it.
    pub session_id: &'a [u8],
    pub authenticator: &'a dyn Authenticator,
}

/// One authentication method in progress on the server.
///
/// `auth` is called with the payload of the `SSH_MSG_USERAUTH_REQUEST`
/// naming this method; the tri-valued result means in-progress /
/// accepted / rejected. While in progress, further method-specific
/// messages arrive through `next`, positioned *on* the message-type
/// byte.
#[async_trait]
pub trait UserAuthMethod: Send {
    async fn auth(
        &mut self,
        ctx: AuthCtx<'_>,
        user: &str,
        service: &str,
        buf: &mut Buffer,
    ) -> Result<Option<bool>, Error>;

    async fn next(&mut self, ctx: AuthCtx<'_>, buf: &mut Buffer) -> Result<Option<bool>, Error> {
        let _ = (ctx, buf);
        Ok(Some(false))
    }
}

/// Creates fresh [`UserAuthMethod`] state per attempt. Lookup by name
/// is case-insensitive.
pub trait UserAuthMethodFactory: Send + Sync {
    fn name(&self) -> &'static str;
    fn create(&self) -> Box<dyn UserAuthMethod>;
}

/// Parse the configured method chains: comma-joined sequences separated
/// by whitespace, e.g. `"publickey,password publickey,keyboard-interactive"`.
/// An empty configuration derives one single-method chain per factory.
/// Every named method must have a factory.
pub fn parse_method_chains(
    methods: &str,
    factories: &[Arc<dyn UserAuthMethodFactory>],
) -> Result<Vec<Vec<String>>, Error> {
    let chains: Vec<Vec<String>> = if methods.trim().is_empty() {
        factories
            .iter()
            .map(|f| vec![f.name().to_string()])
            .collect()
    } else {
        methods
            .split_whitespace()
            .map(|chain| chain.split(',').map(|m| m.to_string()).collect())
            .collect()
    };
    for chain in &chains {
        for method in chain {
            if !factories
                .iter()
                .any(|f| f.name().eq_ignore_ascii_case(method))
            {
                return Err(Error::InvalidConfig(format!(
                    "Configured method is not supported: {method}"
                )));
            }
        }
    }
    Ok(chains)
}

/// Server side of user authentication for one session.
pub struct UserAuthService {
    session: SessionHandle,
    config: Arc<Config>,
    session_id: Vec<u8>,
    authenticator: Arc<dyn Authenticator>,
    factories: Vec<Arc<dyn UserAuthMethodFactory>>,
    auth_methods: Vec<Vec<String>>,
    auth_user: Option<String>,
    auth_service: Option<String>,
    current_method: Option<String>,
    current: Option<Box<dyn UserAuthMethod>>,
    auth_attempts: usize,
    done: Promise<String>,
}

impl UserAuthService {
    pub fn new(
        session: SessionHandle,
        config: Arc<Config>,
        session_id: Vec<u8>,
        authenticator: Arc<dyn Authenticator>,
        factories: Vec<Arc<dyn UserAuthMethodFactory>>,
    ) -> Result<UserAuthService, Error> {
        let auth_methods = parse_method_chains(&config.auth_methods, &factories)?;
        debug!(
            "authorized authentication methods: {:?}",
            factories.iter().map(|f| f.name()).collect::<Vec<_>>()
        );
        Ok(UserAuthService {
            session,
            config,
            session_id,
            authenticator,
            factories,
            auth_methods,
            auth_user: None,
            auth_service: None,
            current_method: None,
            current: None,
            auth_attempts: 0,
            done: Promise::new(),
        })
    }

    /// Completes with the username once the session is authenticated;
    /// the transport then starts the requested service.
    pub fn done(&self) -> Promise<String> {
        self.done.clone()
    }

    pub fn authenticated_user(&self) -> Option<String> {
        self.done
            .peek()
            .and_then(|o| o.value().cloned())
    }

    fn remaining_methods(&self, exclude_none: bool) -> String {
        let mut names: Vec<&str> = Vec::new();
        for chain in &self.auth_methods {
            if let Some(head) = chain.first() {
                if exclude_none && head == "none" {
                    continue;
                }
                if !names.contains(&head.as_str()) {
                    names.push(head);
                }
            }
        }
        names.join(",")
    }

    fn send_failure(&self, partial_success: bool) -> Result<(), Error> {
        let mut buf = Buffer::packet(msg::USERAUTH_FAILURE);
        buf.put_str(&self.remaining_methods(!partial_success));
        buf.put_bool(partial_success);
        self.session.write_packet(buf)
    }

    fn send_success(&self, user: &str) -> Result<(), Error> {
        if let Some(banner) = &self.config.welcome_banner {
            let mut buf = Buffer::packet(msg::USERAUTH_BANNER);
            buf.put_str(banner);
            buf.put_str("en");
            self.session.write_packet(buf)?;
        }
        self.session.write_packet(Buffer::packet(msg::USERAUTH_SUCCESS))?;
        info!("session {user} authenticated");
        self.done.set(user.to_string());
        Ok(())
    }

    /// The accepted method is consumed from the head of every chain it
    /// currently leads; an emptied chain authenticates the session.
    async fn auth_succeeded(&mut self) -> Result<(), Error> {
        let method = self.current_method.clone().unwrap_or_default();
        let user = self.auth_user.clone().unwrap_or_default();
        let mut complete = false;
        for chain in &mut self.auth_methods {
            if chain.first().map(|m| *m == method).unwrap_or(false) {
                chain.remove(0);
                complete |= chain.is_empty();
            }
        }
        if complete {
            if let Some(max) = self.config.max_concurrent_sessions {
                let current = self.authenticator.active_session_count(&user).await;
                if current >= max {
                    self.session.disconnect(
                        Disconnect::ServiceNotAvailable,
                        &format!(
                            "Too many concurrent connections ({current}) - max. allowed: {max}"
                        ),
                        "",
                    );
                    return Err(Error::Disconnect);
                }
            }
            self.send_success(&user)
        } else {
            debug!("partial authentication success with {method} for {user}");
            self.send_failure(true)
        }
    }
}

#[async_trait]
impl Service for UserAuthService {
    async fn process(&mut self, cmd: u8, buf: &mut Buffer) -> Result<(), Error> {
        if self.done.is_done() {
            // Per RFC 4252 §5.1 anything after success could be
            // ignored, but a connection-layer message landing here
            // means the transport routed to the wrong service.
            return Err(Error::Inconsistent);
        }

        let authed: Option<bool>;
        if cmd == msg::USERAUTH_REQUEST {
            debug!("received USERAUTH_REQUEST");
            self.current = None;

            let user = buf.get_str()?;
            let service = buf.get_str()?;
            let method = buf.get_str()?;

            match (&self.auth_user, &self.auth_service) {
                (Some(u), Some(s)) if *u != user || *s != service => {
                    let err = Error::AuthParamChange(u.clone(), s.clone(), user, service);
                    self.session
                        .disconnect(Disconnect::ProtocolError, &err.to_string(), "");
                    return Err(err);
                }
                _ => {
                    self.auth_user = Some(user.clone());
                    self.auth_service = Some(service.clone());
                }
            }
            self.current_method = Some(method.clone());

            self.auth_attempts += 1;
            if self.auth_attempts > self.config.max_auth_requests {
                self.session.disconnect(
                    Disconnect::ProtocolError,
                    "Too many authentication failures",
                    "",
                );
                return Err(Error::TooManyAuthAttempts);
            }

            debug!("authenticating user '{user}' with service '{service}' and method '{method}'");
            let factory = self
                .factories
                .iter()
                .find(|f| f.name().eq_ignore_ascii_case(&method))
                .map(Arc::clone);
            if let Some(factory) = factory {
                let mut state = factory.create();
                let ctx = AuthCtx {
                    session: &self.session,
                    session_id: &self.session_id,
                    authenticator: self.authenticator.as_ref(),
                };
                authed = match state.auth(ctx, &user, &service, buf).await {
                    Ok(r) => r,
                    Err(e) => {
                        // Per-method failures are not fatal to the session.
                        debug!("authentication failed: {e:?}");
                        Some(false)
                    }
                };
                self.current = Some(state);
            } else {
                authed = Some(false);
            }
        } else {
            let ctx = AuthCtx {
                session: &self.session,
                session_id: &self.session_id,
                authenticator: self.authenticator.as_ref(),
            };
            let Some(current) = self.current.as_mut() else {
                return Err(Error::Inconsistent);
            };
            debug!("received authentication message {cmd}");
            // Rewind so the method sees the message-type byte.
            buf.set_rpos(buf.rpos() - 1);
            authed = match current.next(ctx, buf).await {
                Ok(r) => r,
                Err(e) => {
                    debug!("failed to authenticate: {e:?}");
                    Some(false)
                }
            };
        }

        match authed {
            None => {
                debug!("authentication not finished");
                Ok(())
            }
            Some(true) => {
                let r = self.auth_succeeded().await;
                self.current = None;
                r
            }
            Some(false) => {
                debug!("authentication failed");
                self.current = None;
                self.send_failure(false)
            }
        }
    }
}

#[cfg(test)]
mod chain_tests {
    #![allow(clippy::unwrap_used, clippy::panic)]

    use super::*;

    #[test]
    fn chains_parse_and_validate() {
        let factories = default_factories();
        let chains = parse_method_chains("publickey,password publickey,keyboard-interactive", &factories).unwrap();
        assert_eq!(
            chains,
            vec![
                vec!["publickey".to_string(), "password".to_string()],
                vec!["publickey".to_string(), "keyboard-interactive".to_string()],
            ]
        );
        assert!(parse_method_chains("hostbased", &factories).is_err());
    }

    #[test]
    fn empty_config_derives_per_factory_chains() {
        let factories = default_factories();
        let chains = parse_method_chains("", &factories).unwrap();
        assert_eq!(chains.len(), factories.len());
        assert!(chains.iter().all(|c| c.len() == 1));
    }
}
