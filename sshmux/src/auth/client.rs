//! Client side of user authentication: walks a list of methods,
//! narrowing it to what the server still accepts after each failure.

use async_trait::async_trait;
use log::{debug, info};

use crate::{msg, Buffer, Error, Promise, Service, SessionHandle};

use super::methods::signed_auth_blob;

/// An opaque signing capability (a private key, an agent connection).
/// Produces the signature blob - `string algo, string signature` - over
/// the given bytes.
#[async_trait]
pub trait Signer: Send {
    async fn sign(&mut self, data: &[u8]) -> Result<Vec<u8>, Error>;
}

/// A method the client is willing to try, in order.
pub enum ClientMethod {
    None,
    Password {
        password: String,
    },
    PublicKey {
        key: ssh_key::PublicKey,
        signer: Box<dyn Signer>,
    },
}

impl ClientMethod {
    fn name(&self) -> &'static str {
        match self {
            ClientMethod::None => "none",
            ClientMethod::Password { .. } => "password",
            ClientMethod::PublicKey { .. } => "publickey",
        }
    }
}

impl std::fmt::Debug for ClientMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Client-side authentication state machine. Feed it
/// `SSH_MSG_USERAUTH_*` replies; it resolves its promise with whether
/// the session was authenticated.
pub struct ClientUserAuth {
    session: SessionHandle,
    session_id: Vec<u8>,
    user: String,
    service: String,
    methods: std::collections::VecDeque<ClientMethod>,
    current: Option<ClientMethod>,
    done: Promise<bool>,
}

impl ClientUserAuth {
    pub fn new(
        session: SessionHandle,
        session_id: Vec<u8>,
        user: impl Into<String>,
        service: impl Into<String>,
        methods: Vec<ClientMethod>,
    ) -> ClientUserAuth {
        ClientUserAuth {
            session,
            session_id,
            user: user.into(),
            service: service.into(),
            methods: methods.into(),
            current: None,
            done: Promise::new(),
        }
    }

    /// Resolves with `true` once the server accepts us.
    pub fn done(&self) -> Promise<bool> {
        self.done.clone()
    }

    /// Send the first `SSH_MSG_USERAUTH_REQUEST`. Call once the
    /// transport has accepted the `ssh-userauth` service.
    pub fn start(&mut self) -> Result<(), Error> {
        self.try_next(None)
    }

    fn request(&self, body: impl FnOnce(&mut Buffer) -> Result<(), Error>, method: &str) -> Result<(), Error> {
        let mut buf = Buffer::packet(msg::USERAUTH_REQUEST);
        buf.put_str(&self.user);
        buf.put_str(&self.service);
        buf.put_str(method);
        body(&mut buf)?;
        self.session.write_packet(buf)
    }

    /// Try the next configured method the server still allows.
    /// `allowed` of `None` means no failure has narrowed the set yet.
    fn try_next(&mut self, allowed: Option<&[String]>) -> Result<(), Error> {
        loop {
            let Some(method) = self.methods.pop_front() else {
                debug!("no authentication method left");
                self.done.set(false);
                return Err(Error::NoAuthMethod);
            };
            if let Some(allowed) = allowed {
                if !allowed.iter().any(|m| m == method.name()) {
                    debug!("skipping method {} not proposed by the server", method.name());
                    continue;
                }
            }
            match &method {
                ClientMethod::None => self.request(|_| Ok(()), "none")?,
                ClientMethod::Password { password } => {
                    let password = password.clone();
                    self.request(
                        |b| {
                            b.put_bool(false);
                            b.put_str(&password);
                            Ok(())
                        },
                        "password",
                    )?
                }
                ClientMethod::PublicKey { key, .. } => {
                    // Probe first; the signature is computed on PK_OK.
                    let algo = key.algorithm().to_string();
                    let blob = key.to_bytes()?;
                    self.request(
                        |b| {
                            b.put_bool(false);
                            b.put_str(&algo);
                            b.put_string(&blob);
                            Ok(())
                        },
                        "publickey",
                    )?
                }
            }
            self.current = Some(method);
            return Ok(());
        }
    }

    async fn send_signed_request(&mut self) -> Result<(), Error> {
        let Some(ClientMethod::PublicKey { key, signer }) = self.current.as_mut() else {
            return Err(Error::Inconsistent);
        };
        let algo = key.algorithm().to_string();
        let blob = key.to_bytes()?;
        let signed = signed_auth_blob(&self.session_id, &self.user, &self.service, &algo, &blob);
        let signature = signer.sign(signed.payload()).await?;

        let mut buf = Buffer::packet(msg::USERAUTH_REQUEST);
        buf.put_str(&self.user);
        buf.put_str(&self.service);
        buf.put_str("publickey");
        buf.put_bool(true);
        buf.put_str(&algo);
        buf.put_string(&blob);
        buf.put_string(&signature);
        self.session.write_packet(buf)
    }
}

#[async_trait]
impl Service for ClientUserAuth {
    async fn process(&mut self, cmd: u8, buf: &mut Buffer) -> Result<(), Error> {
        match cmd {
            msg::USERAUTH_SUCCESS => {
                info!("authenticated as {}", self.user);
                self.done.set(true);
                Ok(())
            }
            msg::USERAUTH_BANNER => {
                let banner = buf.get_str()?;
                let _language_tag = buf.get_str()?;
                info!("server banner: {}", banner.trim_end());
                Ok(())
            }
            msg::USERAUTH_FAILURE => {
                let allowed = buf.get_name_list()?;
                let partial_success = buf.get_bool()?;
                debug!(
                    "authentication continues: allowed={allowed:?} partial-success={partial_success}"
                );
                self.try_next(Some(&allowed))
            }
            msg::USERAUTH_PK_OK => {
                debug!("server accepted our key offer");
                self.send_signed_request().await
            }
            _ => Err(Error::Inconsistent),
        }
    }
}
