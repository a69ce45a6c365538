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

//! Built-in server authentication methods: `none`, `password`,
//! `publickey` and `keyboard-interactive`. The policy decisions are
//! delegated to an [`Authenticator`].

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use signature::Verifier;
use ssh_key::{Algorithm, PublicKey, Signature};

use crate::{msg, Buffer, Error};

use super::{AuthCtx, UserAuthMethod, UserAuthMethodFactory};

/// One keyboard-interactive round: what to show the user.
#[derive(Debug, Clone)]
pub struct InteractiveChallenge {
    pub name: String,
    pub instruction: String,
    /// Prompt text and whether the user's answer should be echoed.
    pub prompts: Vec<(String, bool)>,
}

/// The decisions the built-in methods delegate to user code.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Check authentication using the "none" method.
    #[allow(unused_variables)]
    async fn auth_none(&self, user: &str) -> Result<bool, Error> {
        Ok(false)
    }

    /// Check authentication using the "password" method.
    #[allow(unused_variables)]
    async fn auth_password(&self, user: &str, password: &str) -> Result<bool, Error> {
        Ok(false)
    }

    /// Whether this key is worth a signature at all: called for the
    /// probe without a signature. The signature is checked by the
    /// method, not here.
    #[allow(unused_variables)]
    async fn auth_publickey_offered(&self, user: &str, key: &PublicKey) -> Result<bool, Error> {
        Ok(true)
    }

    /// Check authentication using the "publickey" method, called after
    /// the signature has been verified.
    #[allow(unused_variables)]
    async fn auth_publickey(&self, user: &str, key: &PublicKey) -> Result<bool, Error> {
        Ok(false)
    }

    /// The challenge to send for "keyboard-interactive"; `None` rejects
    /// the method.
    #[allow(unused_variables)]
    async fn interactive_challenge(
        &self,
        user: &str,
        submethods: &str,
    ) -> Result<Option<InteractiveChallenge>, Error> {
        Ok(None)
    }

    /// Check the responses to an [`InteractiveChallenge`].
    #[allow(unused_variables)]
    async fn check_interactive_responses(
        &self,
        user: &str,
        responses: Vec<String>,
    ) -> Result<bool, Error> {
        Ok(false)
    }

    /// Number of sessions this user already has open, for
    /// `max_concurrent_sessions` enforcement.
    #[allow(unused_variables)]
    async fn active_session_count(&self, user: &str) -> usize {
        0
    }
}

/// The factory set for the built-in methods.
pub fn default_factories() -> Vec<Arc<dyn UserAuthMethodFactory>> {
    vec![
        Arc::new(NoneAuthFactory),
        Arc::new(PasswordAuthFactory),
        Arc::new(PublicKeyAuthFactory),
        Arc::new(KeyboardInteractiveAuthFactory),
    ]
}

pub struct NoneAuthFactory;

impl UserAuthMethodFactory for NoneAuthFactory {
    fn name(&self) -> &'static str {
        "none"
    }

    fn create(&self) -> Box<dyn UserAuthMethod> {
        Box::new(NoneAuth)
    }
}

struct NoneAuth;

#[async_trait]
impl UserAuthMethod for NoneAuth {
    async fn auth(
        &mut self,
        ctx: AuthCtx<'_>,
        user: &str,
        _service: &str,
        _buf: &mut Buffer,
    ) -> Result<Option<bool>, Error> {
        Ok(Some(ctx.authenticator.auth_none(user).await?))
    }
}

pub struct PasswordAuthFactory;

impl UserAuthMethodFactory for PasswordAuthFactory {
    fn name(&self) -> &'static str {
        "password"
    }

    fn create(&self) -> Box<dyn UserAuthMethod> {
        Box::new(PasswordAuth)
    }
}

struct PasswordAuth;

#[async_trait]
impl UserAuthMethod for PasswordAuth {
    async fn auth(
        &mut self,
        ctx: AuthCtx<'_>,
        user: &str,
        _service: &str,
        buf: &mut Buffer,
    ) -> Result<Option<bool>, Error> {
        let change_requested = buf.get_bool()?;
        let password = buf.get_str()?;
        if change_requested {
            // https://tools.ietf.org/html/rfc4252#section-8 - we don't
            // do password changes.
            return Ok(Some(false));
        }
        Ok(Some(ctx.authenticator.auth_password(user, &password).await?))
    }
}

pub struct PublicKeyAuthFactory;

impl UserAuthMethodFactory for PublicKeyAuthFactory {
    fn name(&self) -> &'static str {
        "publickey"
    }

    fn create(&self) -> Box<dyn UserAuthMethod> {
        Box::new(PublicKeyAuth)
    }
}

struct PublicKeyAuth;

/// The blob a public-key signature covers: the session identifier
/// followed by the request up to and including the key (RFC 4252 §7).
pub(crate) fn signed_auth_blob(
    session_id: &[u8],
    user: &str,
    service: &str,
    algo: &str,
    key_blob: &[u8],
) -> Buffer {
    let mut signed = Buffer::new();
    signed.put_string(session_id);
    signed.put_u8(msg::USERAUTH_REQUEST);
    signed.put_str(user);
    signed.put_str(service);
    signed.put_str("publickey");
    signed.put_bool(true);
    signed.put_str(algo);
    signed.put_string(key_blob);
    signed
}

fn parse_signature(blob: &[u8]) -> Result<Signature, Error> {
    let mut buf = Buffer::from_slice(blob);
    let algo = buf.get_str()?;
    let bytes = buf.get_string()?;
    Ok(Signature::new(Algorithm::new(&algo)?, bytes)?)
}

#[async_trait]
impl UserAuthMethod for PublicKeyAuth {
    async fn auth(
        &mut self,
        ctx: AuthCtx<'_>,
        user: &str,
        service: &str,
        buf: &mut Buffer,
    ) -> Result<Option<bool>, Error> {
        let has_signature = buf.get_bool()?;
        let algo = buf.get_str()?;
        let key_blob = buf.get_string()?;
        let key = PublicKey::from_bytes(&key_blob)?;

        if !has_signature {
            // Probe: tell the client whether a signature with this key
            // is worth computing.
            if ctx.authenticator.auth_publickey_offered(user, &key).await? {
                let mut reply = Buffer::packet(msg::USERAUTH_PK_OK);
                reply.put_str(&algo);
                reply.put_string(&key_blob);
                ctx.session.write_packet(reply)?;
                return Ok(None);
            }
            return Ok(Some(false));
        }

        let signature = match parse_signature(&buf.get_string()?) {
            Ok(s) => s,
            Err(e) => {
                debug!("unparseable signature: {e:?}");
                return Ok(Some(false));
            }
        };
        let signed = signed_auth_blob(ctx.session_id, user, service, &algo, &key_blob);
        if Verifier::verify(&key, signed.payload(), &signature).is_err() {
            warn!("signature verification failed for user {user}");
            return Ok(Some(false));
        }
        debug!("signature verified");
        Ok(Some(ctx.authenticator.auth_publickey(user, &key).await?))
    }
}

pub struct KeyboardInteractiveAuthFactory;

impl UserAuthMethodFactory for KeyboardInteractiveAuthFactory {
    fn name(&self) -> &'static str {
        "keyboard-interactive"
    }

    fn create(&self) -> Box<dyn UserAuthMethod> {
        Box::new(KeyboardInteractiveAuth { user: String::new() })
    }
}

struct KeyboardInteractiveAuth {
    user: String,
}

#[async_trait]
impl UserAuthMethod for KeyboardInteractiveAuth {
    async fn auth(
        &mut self,
        ctx: AuthCtx<'_>,
        user: &str,
        _service: &str,
        buf: &mut Buffer,
    ) -> Result<Option<bool>, Error> {
        let _language_tag = buf.get_str()?; // deprecated
        let submethods = buf.get_str()?;
        let Some(challenge) = ctx
            .authenticator
            .interactive_challenge(user, &submethods)
            .await?
        else {
            return Ok(Some(false));
        };
        self.user = user.to_string();
        let mut reply = Buffer::packet(msg::USERAUTH_INFO_REQUEST);
        reply.put_str(&challenge.name);
        reply.put_str(&challenge.instruction);
        reply.put_str(""); // lang, should be empty
        reply.put_u32(challenge.prompts.len() as u32);
        for (prompt, echo) in &challenge.prompts {
            reply.put_str(prompt);
            reply.put_bool(*echo);
        }
        ctx.session.write_packet(reply)?;
        Ok(None)
    }

    async fn next(&mut self, ctx: AuthCtx<'_>, buf: &mut Buffer) -> Result<Option<bool>, Error> {
        if buf.get_u8()? != msg::USERAUTH_INFO_RESPONSE {
            return Ok(Some(false));
        }
        let n = buf.get_u32()?;
        let mut responses = Vec::with_capacity(n as usize);
        for _ in 0..n {
            responses.push(buf.get_str()?);
        }
        Ok(Some(
            ctx.authenticator
                .check_interactive_responses(&self.user, responses)
                .await?,
        ))
    }
}
