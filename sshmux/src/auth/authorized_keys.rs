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

//! OpenSSH `authorized_keys` parsing: one key per line,
//! `[options] keytype base64-blob [comment]`, with `#` comments and
//! blank lines ignored.

use std::path::Path;

use log::debug;
use ssh_key::PublicKey;

use crate::Error;

/// One accepted key with its options.
#[derive(Debug)]
pub struct AuthorizedKey {
    /// Comma-separated options from the front of the line, split into
    /// `name` or `name="value"` pairs.
    pub options: Vec<(String, Option<String>)>,
    pub key: PublicKey,
}

impl AuthorizedKey {
    pub fn comment(&self) -> &str {
        self.key.comment()
    }

    pub fn option(&self, name: &str) -> Option<&Option<String>> {
        self.options
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }
}

/// Split the leading options token of an authorized_keys line,
/// respecting `key="quoted value"` quoting.
fn split_options(line: &str) -> (&str, &str) {
    let mut quoted = false;
    for (i, c) in line.char_indices() {
        match c {
            '"' => quoted = !quoted,
            c if c.is_whitespace() && !quoted => {
                #[allow(clippy::indexing_slicing)] // i is a char boundary
                return (&line[..i], line[i..].trim_start());
            }
            _ => {}
        }
    }
    (line, "")
}

fn parse_options(options: &str) -> Vec<(String, Option<String>)> {
    let mut out = Vec::new();
    let mut quoted = false;
    let mut current = String::new();
    for c in options.chars().chain(std::iter::once(',')) {
        match c {
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            ',' if !quoted => {
                if !current.is_empty() {
                    match current.split_once('=') {
                        Some((name, value)) => out.push((
                            name.to_string(),
                            Some(value.trim_matches('"').to_string()),
                        )),
                        None => out.push((current.clone(), None)),
                    }
                    current.clear();
                }
            }
            c => current.push(c),
        }
    }
    out
}

/// Parse the text of an authorized_keys file. Unparseable lines are
/// skipped with a log message, as sshd does.
pub fn parse_authorized_keys(text: &str) -> Vec<AuthorizedKey> {
    let mut keys = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        // A line either starts with the key type or with options.
        let (options, entry) = match PublicKey::from_openssh(line) {
            Ok(key) => {
                keys.push(AuthorizedKey {
                    options: Vec::new(),
                    key,
                });
                continue;
            }
            Err(_) => split_options(line),
        };
        match PublicKey::from_openssh(entry) {
            Ok(key) => keys.push(AuthorizedKey {
                options: parse_options(options),
                key,
            }),
            Err(e) => {
                debug!("skipping authorized_keys line {}: {e:?}", lineno + 1);
            }
        }
    }
    keys
}

/// Check the strict-mode permission rules: the file must not be more
/// open than `0600` and its directory not more open than `0700`.
#[cfg(unix)]
fn check_strict_permissions(path: &Path) -> Result<(), Error> {
    use std::os::unix::fs::PermissionsExt;

    let mode = std::fs::metadata(path)?.permissions().mode();
    if mode & 0o077 != 0 {
        return Err(Error::InsecurePermissions(path.display().to_string()));
    }
    if let Some(dir) = path.parent() {
        let mode = std::fs::metadata(dir)?.permissions().mode();
        if mode & 0o077 != 0 {
            return Err(Error::InsecurePermissions(dir.display().to_string()));
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_strict_permissions(_path: &Path) -> Result<(), Error> {
    Ok(())
}

/// Load an authorized_keys file. With `strict`, refuse files readable
/// or writable by anyone but the owner.
pub fn load_authorized_keys(path: &Path, strict: bool) -> Result<Vec<AuthorizedKey>, Error> {
    if strict {
        check_strict_permissions(path)?;
    }
    let text = std::fs::read_to_string(path)?;
    Ok(parse_authorized_keys(&text))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::panic)]

    use super::*;

    const ED25519_LINE: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIKWpyj0NXL9iJj/OHyDhtss/BMKtnrPT3QXPyLSF5Jkd test@host";

    #[test]
    fn plain_key_line() {
        let keys = parse_authorized_keys(ED25519_LINE);
        assert_eq!(keys.len(), 1);
        assert!(keys[0].options.is_empty());
        assert_eq!(keys[0].comment(), "test@host");
    }

    #[test]
    fn options_and_comments() {
        let text = format!(
            "# a comment\n\nno-pty,command=\"echo hello, world\",environment=\"FOO=bar\" {ED25519_LINE}\nnot a key at all\n"
        );
        let keys = parse_authorized_keys(&text);
        assert_eq!(keys.len(), 2);
        let with_options = &keys[0];
        assert_eq!(with_options.option("no-pty"), Some(&None));
        assert_eq!(
            with_options.option("command"),
            Some(&Some("echo hello, world".to_string()))
        );
        assert_eq!(
            with_options.option("ENVIRONMENT"),
            Some(&Some("FOO=bar".to_string()))
        );
    }

    #[cfg(unix)]
    #[test]
    fn strict_mode_rejects_open_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = std::env::temp_dir().join(format!("sshmux-authkeys-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700)).unwrap();
        let path = dir.join("authorized_keys");
        std::fs::write(&path, ED25519_LINE).unwrap();

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
        assert!(matches!(
            load_authorized_keys(&path, true),
            Err(Error::InsecurePermissions(_))
        ));

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();
        assert_eq!(load_authorized_keys(&path, true).unwrap().len(), 1);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
