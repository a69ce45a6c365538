#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! OpenSSH-style host configuration: `Host` entries with wildcard
//! patterns, read in order, resolved most-specific-first, with
//! `%`-token substitution in identity-file paths.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use log::debug;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Host not found")]
    HostNotFound,
    #[error("No home directory")]
    NoHome,
    #[error("Invalid host pattern: {0}")]
    InvalidPattern(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The pattern matching every host; a `Host *` entry contributes
/// defaults wherever a more specific entry left a value unset.
pub const ALL_HOSTS_PATTERN: &str = "*";

/// Wildcard characters allowed in a host pattern.
pub const WILDCARD_CHARS: &[char] = &['*', '?'];

/// A pattern character is valid if alphanumeric or one of `-_.*?`.
pub fn is_valid_pattern_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '*' | '?')
}

fn check_pattern(pattern: &str) -> Result<(), Error> {
    if pattern.is_empty() || !pattern.chars().all(is_valid_pattern_char) {
        return Err(Error::InvalidPattern(pattern.to_string()));
    }
    Ok(())
}

/// Case-insensitive wildcard match: `*` matches any run of characters
/// including the empty one, `?` matches exactly one.
pub fn is_host_match(host: &str, pattern: &str) -> bool {
    let host: Vec<char> = host.to_lowercase().chars().collect();
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    glob_match(&host, &pattern)
}

fn glob_match(host: &[char], pattern: &[char]) -> bool {
    match pattern.split_first() {
        None => host.is_empty(),
        Some((&'*', rest)) => {
            (0..=host.len()).any(|skip| glob_match(host.get(skip..).unwrap_or(&[]), rest))
        }
        Some((&'?', rest)) => match host.split_first() {
            Some((_, host_rest)) => glob_match(host_rest, rest),
            None => false,
        },
        Some((c, rest)) => match host.split_first() {
            Some((h, host_rest)) => h == c && glob_match(host_rest, rest),
            None => false,
        },
    }
}

/// One `Host` block of the configuration file.
#[derive(Debug, Clone, Default)]
pub struct HostConfigEntry {
    /// The pattern this entry was declared under. A line listing
    /// several patterns produces several entries sharing one body.
    pub host: String,
    pub host_name: Option<String>,
    /// 0 means unset.
    pub port: u16,
    pub user: Option<String>,
    pub identity_files: Vec<String>,
    pub proxy_command: Option<String>,
    /// Every other `Keyword Value` directive, keyed lowercase.
    pub properties: HashMap<String, String>,
}

impl HostConfigEntry {
    pub fn matches(&self, host: &str) -> bool {
        is_host_match(host, &self.host)
    }

    /// How tightly the pattern pins the host: the number of
    /// non-wildcard characters. An exact name beats `test*` beats `*`.
    fn specificity(&self) -> usize {
        self.host.chars().filter(|c| !WILDCARD_CHARS.contains(c)).count()
    }
}

/// The entry value wins when it is set (`> 0`).
pub fn resolve_port(original: u16, entry: u16) -> u16 {
    if entry > 0 {
        entry
    } else {
        original
    }
}

/// The entry value wins when it is non-empty.
pub fn resolve_username(original: &str, entry: Option<&str>) -> String {
    match entry {
        Some(u) if !u.is_empty() => u.to_string(),
        _ => original.to_string(),
    }
}

/// Values substituted into identity-file paths at resolution time.
#[derive(Debug, Clone, Default)]
pub struct TokenContext {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub home: Option<PathBuf>,
    pub local_hostname: String,
}

impl TokenContext {
    pub fn new(host: &str, port: u16, user: &str) -> TokenContext {
        TokenContext {
            host: host.to_string(),
            port,
            user: user.to_string(),
            home: dirs_next::home_dir(),
            local_hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
        }
    }
}

/// Expand `%h`, `%p`, `%u`, `%r`, `%d`, `%l`, `%%` and a leading `~`.
/// Substitution happens once, here, at resolution time.
pub fn resolve_identity_path(path: &str, ctx: &TokenContext) -> Result<PathBuf, Error> {
    let home = || -> Result<String, Error> {
        let home = ctx.home.clone().ok_or(Error::NoHome)?;
        Ok(home.to_string_lossy().into_owned())
    };
    let path = if let Some(rest) = path.strip_prefix("~/").or_else(|| path.strip_prefix('~')) {
        format!("{}/{}", home()?, rest.trim_start_matches('/'))
    } else {
        path.to_string()
    };

    let mut out = String::with_capacity(path.len());
    let mut chars = path.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('h') => out.push_str(&ctx.host),
            Some('p') => out.push_str(&ctx.port.to_string()),
            Some('u') | Some('r') => out.push_str(&ctx.user),
            Some('d') => out.push_str(&home()?),
            Some('l') => out.push_str(&ctx.local_hostname),
            Some('%') => out.push('%'),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    Ok(PathBuf::from(out))
}

/// Parse a configuration file. `Host` starts a new block; a line may
/// carry several patterns, producing several entries with the same
/// body; `#` starts a comment.
pub fn parse(file: &str) -> Result<Vec<HostConfigEntry>, Error> {
    let mut entries: Vec<HostConfigEntry> = Vec::new();
    // Indices of the entries the current body lines apply to.
    let mut current: Vec<usize> = Vec::new();

    for line in file.lines() {
        let line = match line.find('#') {
            Some(i) => line.get(..i).unwrap_or(""),
            None => line,
        }
        .trim();
        if line.is_empty() {
            continue;
        }
        let Some(n) = line.find(char::is_whitespace) else {
            continue;
        };
        let (key, value) = line.split_at(n);
        let value = value.trim_start();
        let lower = key.to_lowercase();

        if lower == "host" {
            current.clear();
            for pattern in value.split_whitespace() {
                check_pattern(pattern)?;
                current.push(entries.len());
                entries.push(HostConfigEntry {
                    host: pattern.to_string(),
                    ..HostConfigEntry::default()
                });
            }
            continue;
        }
        if current.is_empty() {
            debug!("directive before any Host block: {key}");
            continue;
        }
        for &i in &current {
            let Some(entry) = entries.get_mut(i) else {
                continue;
            };
            match lower.as_str() {
                "hostname" => entry.host_name = Some(value.to_string()),
                "port" => {
                    if let Ok(port) = value.parse() {
                        entry.port = port
                    }
                }
                "user" => entry.user = Some(value.to_string()),
                "identityfile" => entry.identity_files.push(value.to_string()),
                "proxycommand" => entry.proxy_command = Some(value.to_string()),
                _ => {
                    entry
                        .properties
                        .insert(lower.clone(), value.to_string());
                }
            }
        }
    }
    Ok(entries)
}

pub fn parse_path<P: AsRef<Path>>(path: P) -> Result<Vec<HostConfigEntry>, Error> {
    let mut s = String::new();
    let mut f = std::fs::File::open(path)?;
    f.read_to_string(&mut s)?;
    parse(&s)
}

/// Parse `~/.ssh/config`.
pub fn parse_home() -> Result<Vec<HostConfigEntry>, Error> {
    let mut home = dirs_next::home_dir().ok_or(Error::NoHome)?;
    home.push(".ssh");
    home.push("config");
    parse_path(&home)
}

/// The matching entry with the highest specificity, regardless of
/// declaration order; ties go to the earliest entry.
pub fn find_best_match<'a>(
    host: &str,
    entries: &'a [HostConfigEntry],
) -> Option<&'a HostConfigEntry> {
    entries
        .iter()
        .filter(|e| e.matches(host))
        .min_by_key(|e| std::cmp::Reverse(e.specificity()))
}

/// The effective configuration for a host: the best match, with the
/// `Host *` global entry filling in whatever it left unset.
pub fn resolve(host: &str, entries: &[HostConfigEntry]) -> Result<HostConfigEntry, Error> {
    let best = find_best_match(host, entries).ok_or(Error::HostNotFound)?;
    let mut resolved = best.clone();
    if best.host != ALL_HOSTS_PATTERN {
        if let Some(global) = entries.iter().find(|e| e.host == ALL_HOSTS_PATTERN) {
            if resolved.host_name.is_none() {
                resolved.host_name = global.host_name.clone();
            }
            if resolved.port == 0 {
                resolved.port = global.port;
            }
            if resolved.user.is_none() {
                resolved.user = global.user.clone();
            }
            if resolved.identity_files.is_empty() {
                resolved.identity_files = global.identity_files.clone();
            }
            if resolved.proxy_command.is_none() {
                resolved.proxy_command = global.proxy_command.clone();
            }
            for (k, v) in &global.properties {
                resolved
                    .properties
                    .entry(k.clone())
                    .or_insert_with(|| v.clone());
            }
        }
    }
    if resolved.host_name.is_none() {
        resolved.host_name = Some(host.to_string());
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::indexing_slicing, clippy::panic)]

    use super::*;

    #[test]
    fn wildcard_star_matches_runs() {
        for n in 0..=255u32 {
            let address = format!("10.0.0.{n}");
            assert!(is_host_match(&address, "10.0.0.*"), "{address}");
        }
        assert!(is_host_match("anything.example.com", "*"));
        assert!(is_host_match("", "*"));
        assert!(is_host_match("TESTHOST", "test*"));
        assert!(!is_host_match("10.0.1.5", "10.0.0.*"));
    }

    #[test]
    fn wildcard_question_mark_matches_exactly_one() {
        assert!(is_host_match("a", "?"));
        assert!(!is_host_match("", "?"));
        assert!(!is_host_match("ab", "?"));
        for n in 0..=9 {
            assert!(is_host_match(&format!("10.0.0.{n}"), "10.0.0.?"));
        }
        assert!(!is_host_match("10.0.0.10", "10.0.0.?"));
    }

    #[test]
    fn pattern_character_validity() {
        for c in ('a'..='z').chain('A'..='Z').chain('0'..='9') {
            assert!(is_valid_pattern_char(c), "{c}");
        }
        for c in ['-', '_', '.', '*', '?'] {
            assert!(is_valid_pattern_char(c), "{c}");
        }
        for c in [' ', ',', '!', '/', '\\', '(', '%'] {
            assert!(!is_valid_pattern_char(c), "{c}");
        }
    }

    #[test]
    fn port_and_username_preference() {
        assert_eq!(resolve_port(22, 2222), 2222);
        assert_eq!(resolve_port(22, 0), 22);
        assert_eq!(resolve_username("original", Some("entry")), "entry");
        assert_eq!(resolve_username("original", Some("")), "original");
        assert_eq!(resolve_username("original", None), "original");
    }

    #[test]
    fn best_match_is_most_specific_regardless_of_order() {
        let config = "Host *\n  Port 22\nHost test*\n  Port 2000\nHost testhost\n  Port 3000\n";
        let entries = parse(config).unwrap();
        let best = find_best_match("testhost", &entries).unwrap();
        assert_eq!(best.host, "testhost");

        // Same entries, reversed declaration order.
        let config = "Host testhost\n  Port 3000\nHost test*\n  Port 2000\nHost *\n  Port 22\n";
        let entries = parse(config).unwrap();
        assert_eq!(find_best_match("testhost", &entries).unwrap().host, "testhost");
        assert_eq!(find_best_match("testing", &entries).unwrap().host, "test*");
        assert_eq!(find_best_match("other", &entries).unwrap().host, "*");
    }

    #[test]
    fn global_entry_contributes_only_missing_values() {
        let config = "\
Host *
  User fallback
  Port 2222
  IdentityFile ~/.ssh/id_default

Host gateway
  HostName gw.example.com
  User root
";
        let entries = parse(config).unwrap();
        let resolved = resolve("gateway", &entries).unwrap();
        assert_eq!(resolved.host_name.as_deref(), Some("gw.example.com"));
        assert_eq!(resolved.user.as_deref(), Some("root"));
        assert_eq!(resolved.port, 2222);
        assert_eq!(resolved.identity_files, vec!["~/.ssh/id_default"]);
    }

    #[test]
    fn multiple_patterns_share_one_body() {
        let config = "Host alpha beta gamma\n  HostName shared.example.com\n  Port 2022\n";
        let entries = parse(config).unwrap();
        assert_eq!(entries.len(), 3);
        for entry in &entries {
            assert_eq!(entry.host_name.as_deref(), Some("shared.example.com"));
            assert_eq!(entry.port, 2022);
        }
        assert_eq!(entries[0].host, "alpha");
        assert_eq!(entries[2].host, "gamma");
    }

    #[test]
    fn comments_and_unknown_directives() {
        let config = "\
# leading comment
Host example # trailing comment
  HostName real.example.com
  Compression yes
";
        let entries = parse(config).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].properties.get("compression").map(String::as_str), Some("yes"));
    }

    #[test]
    fn identity_path_token_substitution() {
        let ctx = TokenContext {
            host: "server".to_string(),
            port: 2022,
            user: "alice".to_string(),
            home: Some(PathBuf::from("/home/alice")),
            local_hostname: "workstation".to_string(),
        };
        let p = resolve_identity_path("~/.ssh/id_%h_%p_%u", &ctx).unwrap();
        assert_eq!(p, PathBuf::from("/home/alice/.ssh/id_server_2022_alice"));
        let p = resolve_identity_path("%d/keys/%r@%l%%", &ctx).unwrap();
        assert_eq!(p, PathBuf::from("/home/alice/keys/alice@workstation%"));
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        assert!(matches!(
            parse("Host bad,pattern\n  Port 22\n"),
            Err(Error::InvalidPattern(_))
        ));
    }
}
