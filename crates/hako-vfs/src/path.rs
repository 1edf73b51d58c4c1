//! VFS path syntax.
//!
//! A VFS path is an ordinary absolute path in which any element may carry a
//! `#op` marker: `/home/me/src.tar#utar/dir/file.c`. Everything before the
//! marker names the outer object (the archive), `op` selects a class by its
//! prefix and may carry arguments (`sh:user@host:22`), and everything after
//! the next `/` is the path inside that class. Markers nest left to right.
//!
//! URLs (`scheme://rest`) are rewritten into the marker form when `scheme`
//! names a registered class.

use bitflags::bitflags;
use std::borrow::Cow;

/// The pieces of a path split at its rightmost claimed `#op` marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split<'a> {
    /// Path of the outer object, possibly empty (`/#mem/...`).
    pub archive: &'a str,
    /// The marker text after `#`, up to the next `/`.
    pub op: &'a str,
    /// Path inside the class, without a leading `/`.
    pub inner: &'a str,
}

/// Normalize a path: collapse `//`, drop `.` elements, fold `..` into the
/// preceding element and strip trailing slashes.
///
/// A leading `..` on a relative path is kept; on an absolute path it is
/// dropped, as `/..` is `/`.
pub fn canonicalize(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();

    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&"..") | None if !absolute => parts.push(".."),
                Some(_) => {
                    parts.pop();
                }
                None => {}
            },
            other => parts.push(other),
        }
    }

    let joined = parts.join("/");
    if absolute {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Rewrite `scheme://rest` into `/#scheme:rest` when `claims(scheme)` holds.
pub fn translate_url<'a>(url: &'a str, claims: impl Fn(&str) -> bool) -> Cow<'a, str> {
    match url.split_once("://") {
        Some((scheme, rest))
            if !scheme.is_empty() && !scheme.contains('/') && claims(scheme) =>
        {
            Cow::Owned(format!("/#{scheme}:{rest}"))
        }
        _ => Cow::Borrowed(url),
    }
}

/// Turn any user-supplied path into a canonical absolute VFS path.
///
/// Applies URL translation, tilde expansion (when `tilde` is set), makes
/// relative paths absolute against `cwd` and canonicalizes the result.
pub fn canon(path: &str, cwd: &str, tilde: bool, claims: impl Fn(&str) -> bool) -> String {
    let path = translate_url(path, claims);
    let path: Cow<'_, str> = if tilde && path.starts_with('~') {
        Cow::Owned(shellexpand::tilde(path.as_ref()).into_owned())
    } else {
        path
    };

    if path.starts_with('/') {
        canonicalize(&path)
    } else {
        canonicalize(&join(cwd, &path))
    }
}

/// Join a directory and a name with exactly one separator.
pub fn join(dir: &str, name: &str) -> String {
    if dir.ends_with('/') || dir.is_empty() {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// Split `path` at its rightmost `#op` marker whose op is claimed by a class.
///
/// Markers that no class claims are treated as plain file name characters,
/// and the search continues to the left. Returns `None` for plain paths.
pub fn split<'a>(path: &'a str, claims: impl Fn(&str) -> bool) -> Option<Split<'a>> {
    let mut search_end = path.len();
    while let Some(hash) = path[..search_end].rfind('#') {
        let after = &path[hash + 1..];
        let (op, inner) = match after.find('/') {
            Some(slash) => (&after[..slash], &after[slash + 1..]),
            None => (after, ""),
        };
        if claims(op) {
            return Some(Split {
                archive: &path[..hash],
                op,
                inner,
            });
        }
        search_end = hash;
    }
    None
}

/// Remove a trailing claimed `#op` marker from a file name.
pub fn strip_suffix(name: &str, claims: impl Fn(&str) -> bool) -> &str {
    match name.rfind('#') {
        Some(hash) if claims(&name[hash + 1..]) => &name[..hash],
        _ => name,
    }
}

bitflags! {
    /// Options for [`split_url`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UrlFlags: u8 {
        /// The text has no path part; everything is `[user@]host[:port]`.
        const NO_SLASH = 1 << 0;
        /// Leave the user unset when none is given.
        const ALLOW_ANON = 1 << 1;
    }
}

/// Connection coordinates parsed out of an `op` argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlParts {
    pub user: Option<String>,
    pub password: Option<String>,
    pub host: String,
    pub port: u16,
    /// Remote path, starting with `/`. `None` with [`UrlFlags::NO_SLASH`].
    pub path: Option<String>,
}

/// Parse `[user[:password]@]host[:port][/path]`.
///
/// Without [`UrlFlags::ALLOW_ANON`] a missing user defaults to the current
/// login name. A port outside `1..=65535` or one that does not parse falls
/// back to `default_port`.
pub fn split_url(text: &str, default_port: u16, flags: UrlFlags) -> UrlParts {
    let (authority, path) = if flags.contains(UrlFlags::NO_SLASH) {
        (text, None)
    } else {
        match text.find('/') {
            Some(slash) => (&text[..slash], Some(text[slash..].to_string())),
            None => (text, Some("/".to_string())),
        }
    };

    let (userinfo, rest) = match authority.rfind('@') {
        Some(at) => (Some(&authority[..at]), &authority[at + 1..]),
        None => (None, authority),
    };

    let mut user = None;
    let mut password = None;
    if let Some(info) = userinfo {
        let (name, pass) = match info.split_once(':') {
            Some((name, pass)) => (name, Some(pass)),
            None => (info, None),
        };
        password = pass.map(str::to_string);
        if !name.is_empty() {
            user = Some(name.to_string());
        }
    }
    if user.is_none() && !flags.contains(UrlFlags::ALLOW_ANON) {
        user = Some(whoami::username());
    }

    let (host, port) = match rest.split_once(':') {
        Some((host, port)) => (host, parse_port(port).unwrap_or(default_port)),
        None => (rest, default_port),
    };

    UrlParts {
        user,
        password,
        host: host.to_string(),
        port,
        path,
    }
}

fn parse_port(text: &str) -> Option<u16> {
    let digits: &str = &text[..text.find(|c: char| !c.is_ascii_digit()).unwrap_or(text.len())];
    match digits.parse::<u16>() {
        Ok(0) | Err(_) => None,
        Ok(port) => Some(port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims_utar(op: &str) -> bool {
        op.starts_with("utar") || op.starts_with("sh")
    }

    #[test]
    fn test_canonicalize() {
        assert_eq!(canonicalize("/a//b/./c/"), "/a/b/c");
        assert_eq!(canonicalize("/a/b/../c"), "/a/c");
        assert_eq!(canonicalize("/.."), "/");
        assert_eq!(canonicalize("/"), "/");
        assert_eq!(canonicalize("a/../.."), "..");
        assert_eq!(canonicalize("./"), ".");
        assert_eq!(canonicalize("/x.tar#utar/d/../f"), "/x.tar#utar/f");
    }

    #[test]
    fn test_canon_relative_and_url() {
        assert_eq!(canon("b/c", "/a", false, claims_utar), "/a/b/c");
        assert_eq!(canon("../z", "/a/b", false, claims_utar), "/a/z");
        assert_eq!(
            canon("sh://me@host/etc", "/", false, claims_utar),
            "/#sh:me@host/etc"
        );
        // unknown schemes stay relative paths
        assert_eq!(canon("ftp://x", "/w", false, claims_utar), "/w/ftp:/x");
    }

    #[test]
    fn test_split_rightmost_claimed() {
        let s = split("/home/a.tar#utar/dir/file.c", claims_utar).unwrap();
        assert_eq!(s.archive, "/home/a.tar");
        assert_eq!(s.op, "utar");
        assert_eq!(s.inner, "dir/file.c");

        let s = split("/a.tar#utar/b.tar#utar/x", claims_utar).unwrap();
        assert_eq!(s.archive, "/a.tar#utar/b.tar");
        assert_eq!(s.inner, "x");

        let s = split("/a.tar#utar/notes#1/x", claims_utar).unwrap();
        assert_eq!(s.archive, "/a.tar");
        assert_eq!(s.inner, "notes#1/x");

        let s = split("/#sh:host", claims_utar).unwrap();
        assert_eq!(s.archive, "");
        assert_eq!(s.op, "sh:host");
        assert_eq!(s.inner, "");

        assert!(split("/plain/path#1", claims_utar).is_none());
    }

    #[test]
    fn test_strip_suffix() {
        assert_eq!(strip_suffix("src.tar#utar", claims_utar), "src.tar");
        assert_eq!(strip_suffix("issue#42", claims_utar), "issue#42");
        assert_eq!(strip_suffix("plain", claims_utar), "plain");
    }

    #[test]
    fn test_split_url() {
        let url = split_url("joe:secret@example.org:2222/srv/data", 22, UrlFlags::empty());
        assert_eq!(url.user.as_deref(), Some("joe"));
        assert_eq!(url.password.as_deref(), Some("secret"));
        assert_eq!(url.host, "example.org");
        assert_eq!(url.port, 2222);
        assert_eq!(url.path.as_deref(), Some("/srv/data"));

        let url = split_url("example.org:99999", 21, UrlFlags::ALLOW_ANON);
        assert_eq!(url.user, None);
        assert_eq!(url.port, 21);
        assert_eq!(url.path.as_deref(), Some("/"));

        let url = split_url("host", 22, UrlFlags::NO_SLASH);
        assert!(url.user.is_some());
        assert_eq!(url.path, None);
    }
}
