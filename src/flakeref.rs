use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::FlakeError;

/// A git revision: 40 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rev(String);

impl Rev {
    pub const LEN: usize = 40;

    pub fn parse(s: &str) -> Result<Self, FlakeError> {
        if Self::looks_like_rev(s) {
            Ok(Rev(s.to_ascii_lowercase()))
        } else {
            Err(FlakeError::invalid_ref(
                s,
                "revision must be 40 hexadecimal characters",
            ))
        }
    }

    pub fn looks_like_rev(s: &str) -> bool {
        s.len() == Self::LEN && s.chars().all(|c| c.is_ascii_hexdigit())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form used in source-info records.
    pub fn short(&self) -> &str {
        &self.0[..7]
    }
}

impl fmt::Display for Rev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a flake's source comes from.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RefKind {
    /// Symbolic name looked up in the registries.
    Indirect { id: String },
    GitHub { owner: String, repo: String },
    Git { uri: String },
    /// Absolute path to a local working tree.
    Path { path: PathBuf },
}

/// A flake reference: a source location plus the modifiers shared by every
/// kind of location.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FlakeRef {
    pub kind: RefKind,
    /// Branch or tag name.
    pub ref_name: Option<String>,
    pub rev: Option<Rev>,
    /// Directory of the flake relative to the source tree root.
    pub subdir: String,
}

impl FlakeRef {
    pub fn new(kind: RefKind) -> Self {
        FlakeRef {
            kind,
            ref_name: None,
            rev: None,
            subdir: String::new(),
        }
    }

    pub fn indirect(id: impl Into<String>) -> Self {
        Self::new(RefKind::Indirect { id: id.into() })
    }

    pub fn github(owner: impl Into<String>, repo: impl Into<String>) -> Self {
        Self::new(RefKind::GitHub {
            owner: owner.into(),
            repo: repo.into(),
        })
    }

    pub fn git(uri: impl Into<String>) -> Self {
        Self::new(RefKind::Git { uri: uri.into() })
    }

    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self::new(RefKind::Path { path: path.into() })
    }

    pub fn with_ref(mut self, ref_name: impl Into<String>) -> Self {
        self.ref_name = Some(ref_name.into());
        self
    }

    pub fn with_rev(mut self, rev: Rev) -> Self {
        self.rev = Some(rev);
        self
    }

    pub fn with_subdir(mut self, subdir: impl Into<String>) -> Self {
        self.subdir = subdir.into();
        self
    }

    pub fn is_direct(&self) -> bool {
        !matches!(self.kind, RefKind::Indirect { .. })
    }

    pub fn is_immutable(&self) -> bool {
        self.rev.is_some()
    }

    /// The location alone, without `ref`, `rev` or `subdir`.
    pub fn base_ref(&self) -> FlakeRef {
        FlakeRef::new(self.kind.clone())
    }

    /// Path of the local tree, for path references.
    pub fn local_path(&self) -> Option<&Path> {
        match &self.kind {
            RefKind::Path { path } => Some(path),
            _ => None,
        }
    }

    pub fn parse(input: &str) -> Result<Self, FlakeError> {
        let (body, query) = match input.split_once('?') {
            Some((body, query)) => (body, Some(query)),
            None => (input, None),
        };

        let mut flake_ref = if let Some(rest) = body.strip_prefix("github:") {
            parse_github(input, rest)?
        } else if let Some(uri) = body.strip_prefix("git+") {
            if !uri.contains("://") {
                return Err(FlakeError::invalid_ref(input, "git URI lacks a scheme"));
            }
            FlakeRef::git(uri)
        } else if body.starts_with("git://") {
            FlakeRef::git(body)
        } else if let Some(path) = body.strip_prefix("path:") {
            parse_path(input, path)?
        } else if body.starts_with('/') {
            parse_path(input, body)?
        } else {
            parse_indirect(input, body.strip_prefix("flake:").unwrap_or(body))?
        };

        if let Some(query) = query {
            apply_query(input, query, &mut flake_ref)?;
        }

        Ok(flake_ref)
    }

    /// Branch name to write as a path segment. Names containing `/` would
    /// split into extra segments, so they go to the query instead.
    fn ref_segment(&self) -> Option<&str> {
        self.ref_name.as_deref().filter(|r| !r.contains('/'))
    }

    fn query_params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        match &self.kind {
            RefKind::Indirect { .. } | RefKind::GitHub { .. } => {
                if let (Some(ref_name), None) = (&self.ref_name, self.ref_segment()) {
                    params.push(("ref", ref_name.clone()));
                }
                // github:<owner>/<repo>/<ref> leaves no segment for the rev
                if let (RefKind::GitHub { .. }, Some(_), Some(rev)) = (&self.kind, self.ref_segment(), &self.rev) {
                    params.push(("rev", rev.to_string()));
                }
            }
            RefKind::Git { .. } | RefKind::Path { .. } => {
                if let Some(ref_name) = &self.ref_name {
                    params.push(("ref", ref_name.clone()));
                }
                if let Some(rev) = &self.rev {
                    params.push(("rev", rev.to_string()));
                }
            }
        }
        if !self.subdir.is_empty() {
            params.push(("dir", self.subdir.clone()));
        }
        params
    }
}

fn parse_github(input: &str, rest: &str) -> Result<FlakeRef, FlakeError> {
    let parts: Vec<&str> = rest.split('/').collect();
    if parts.len() < 2 || parts.len() > 3 {
        return Err(FlakeError::invalid_ref(
            input,
            "expected github:<owner>/<repo>[/<ref-or-rev>]",
        ));
    }
    for part in &parts[..2] {
        if part.is_empty()
            || !part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(FlakeError::invalid_ref(
                input,
                format!("invalid GitHub owner or repository '{}'", part),
            ));
        }
    }
    let mut flake_ref = FlakeRef::github(parts[0], parts[1]);
    if let Some(selector) = parts.get(2) {
        set_ref_or_rev(input, &mut flake_ref, selector)?;
    }
    Ok(flake_ref)
}

fn parse_path(input: &str, path: &str) -> Result<FlakeRef, FlakeError> {
    let path = PathBuf::from(path);
    if !path.is_absolute() {
        return Err(FlakeError::invalid_ref(input, "path must be absolute"));
    }
    Ok(FlakeRef::path(path))
}

fn parse_indirect(input: &str, body: &str) -> Result<FlakeRef, FlakeError> {
    let parts: Vec<&str> = body.split('/').collect();
    let id = parts[0];
    let valid_id = id.starts_with(|c: char| c.is_ascii_alphabetic())
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'));
    if !valid_id {
        return Err(FlakeError::invalid_ref(
            input,
            format!("'{}' is not a valid flake identifier", id),
        ));
    }

    let mut flake_ref = FlakeRef::indirect(id);
    match parts.len() {
        1 => {}
        2 => set_ref_or_rev(input, &mut flake_ref, parts[1])?,
        3 => {
            set_ref_name(input, &mut flake_ref, parts[1])?;
            flake_ref.rev = Some(Rev::parse(parts[2])?);
        }
        _ => {
            return Err(FlakeError::invalid_ref(
                input,
                "expected <id>[/<ref>][/<rev>]",
            ))
        }
    }
    Ok(flake_ref)
}

fn set_ref_or_rev(input: &str, flake_ref: &mut FlakeRef, selector: &str) -> Result<(), FlakeError> {
    if Rev::looks_like_rev(selector) {
        flake_ref.rev = Some(Rev::parse(selector)?);
        Ok(())
    } else {
        set_ref_name(input, flake_ref, selector)
    }
}

fn set_ref_name(input: &str, flake_ref: &mut FlakeRef, name: &str) -> Result<(), FlakeError> {
    if name.is_empty() || name.starts_with('-') || name.contains(char::is_whitespace) {
        return Err(FlakeError::invalid_ref(
            input,
            format!("'{}' is not a valid branch or tag name", name),
        ));
    }
    flake_ref.ref_name = Some(name.to_string());
    Ok(())
}

fn apply_query(input: &str, query: &str, flake_ref: &mut FlakeRef) -> Result<(), FlakeError> {
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| FlakeError::invalid_ref(input, format!("malformed parameter '{}'", pair)))?;
        match key {
            "ref" if flake_ref.ref_name.is_none() => set_ref_name(input, flake_ref, value)?,
            "rev" if flake_ref.rev.is_none() => flake_ref.rev = Some(Rev::parse(value)?),
            "dir" if flake_ref.subdir.is_empty() => flake_ref.subdir = value.to_string(),
            "ref" | "rev" | "dir" => {
                return Err(FlakeError::invalid_ref(
                    input,
                    format!("parameter '{}' given more than once", key),
                ))
            }
            other => {
                return Err(FlakeError::invalid_ref(
                    input,
                    format!("unsupported parameter '{}'", other),
                ))
            }
        }
    }
    Ok(())
}

impl fmt::Display for FlakeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            RefKind::Indirect { id } => {
                write!(f, "{}", id)?;
                if let Some(ref_name) = self.ref_segment() {
                    write!(f, "/{}", ref_name)?;
                }
                if let Some(rev) = &self.rev {
                    write!(f, "/{}", rev)?;
                }
            }
            RefKind::GitHub { owner, repo } => {
                write!(f, "github:{}/{}", owner, repo)?;
                match (self.ref_segment(), &self.rev) {
                    (Some(ref_name), _) => write!(f, "/{}", ref_name)?,
                    (None, Some(rev)) => write!(f, "/{}", rev)?,
                    (None, None) => {}
                }
            }
            RefKind::Git { uri } => write!(f, "git+{}", uri)?,
            RefKind::Path { path } => write!(f, "{}", path.display())?,
        }

        let params = self.query_params();
        if !params.is_empty() {
            let query = params
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join("&");
            write!(f, "?{}", query)?;
        }
        Ok(())
    }
}

impl FromStr for FlakeRef {
    type Err = FlakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FlakeRef::parse(s)
    }
}

impl Serialize for FlakeRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FlakeRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        FlakeRef::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REV: &str = "0123456789abcdef0123456789abcdef01234567";

    #[test]
    fn test_parse_indirect() {
        let r = FlakeRef::parse("nixpkgs").unwrap();
        assert_eq!(r, FlakeRef::indirect("nixpkgs"));
        assert!(!r.is_direct());
        assert!(!r.is_immutable());

        let r = FlakeRef::parse("foo/v2?dir=sub").unwrap();
        assert_eq!(r.kind, RefKind::Indirect { id: "foo".into() });
        assert_eq!(r.ref_name.as_deref(), Some("v2"));
        assert_eq!(r.subdir, "sub");

        let r = FlakeRef::parse(&format!("flake:foo/release/{}", REV)).unwrap();
        assert_eq!(r.ref_name.as_deref(), Some("release"));
        assert_eq!(r.rev.as_ref().map(Rev::as_str), Some(REV));
        assert!(r.is_immutable());
    }

    #[test]
    fn test_parse_github() {
        let r = FlakeRef::parse("github:a/b").unwrap();
        assert_eq!(r, FlakeRef::github("a", "b"));
        assert!(r.is_direct());

        let r = FlakeRef::parse(&format!("github:NixOS/nixpkgs/{}", REV)).unwrap();
        assert!(r.ref_name.is_none());
        assert_eq!(r.rev.unwrap().as_str(), REV);

        let r = FlakeRef::parse("github:NixOS/nixpkgs/release-19.09").unwrap();
        assert_eq!(r.ref_name.as_deref(), Some("release-19.09"));
    }

    #[test]
    fn test_parse_git_and_path() {
        let r = FlakeRef::parse("git+https://x/foo?ref=v2&dir=sub").unwrap();
        assert_eq!(r.kind, RefKind::Git { uri: "https://x/foo".into() });
        assert_eq!(r.ref_name.as_deref(), Some("v2"));
        assert_eq!(r.subdir, "sub");

        let r = FlakeRef::parse("/home/user/flake").unwrap();
        assert_eq!(r.local_path(), Some(Path::new("/home/user/flake")));

        let r = FlakeRef::parse("path:/srv/flake?dir=nested").unwrap();
        assert_eq!(r.local_path(), Some(Path::new("/srv/flake")));
        assert_eq!(r.subdir, "nested");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(FlakeRef::parse("github:onlyowner").is_err());
        assert!(FlakeRef::parse("git+nope").is_err());
        assert!(FlakeRef::parse("path:relative").is_err());
        assert!(FlakeRef::parse("1nvalid").is_err());
        assert!(FlakeRef::parse("nixpkgs?color=blue").is_err());
        assert!(FlakeRef::parse("nixpkgs/a/b/c").is_err());
        assert!(FlakeRef::parse("nixpkgs/main/not-a-rev").is_err());
    }

    #[test]
    fn test_display_reparses() {
        for s in [
            "nixpkgs",
            "nixpkgs/release-19.09",
            "github:NixOS/nixpkgs",
            "github:NixOS/nixpkgs/master?dir=lib",
            "git+https://example.org/repo.git?ref=main",
            "/srv/flake?dir=sub",
            "github:a/b?ref=feature/x",
            "foo?ref=feature/x",
            "git+https://example.org/repo.git?ref=feature/x",
        ] {
            let parsed = FlakeRef::parse(s).unwrap();
            assert_eq!(parsed.to_string(), s);
        }

        let pinned = FlakeRef::github("a", "b")
            .with_ref("main")
            .with_rev(Rev::parse(REV).unwrap());
        assert_eq!(FlakeRef::parse(&pinned.to_string()).unwrap(), pinned);

        let rev = Rev::parse(REV).unwrap();
        for slashed in [
            FlakeRef::github("a", "b").with_ref("feature/x").with_rev(rev.clone()),
            FlakeRef::indirect("foo").with_ref("feature/x").with_rev(rev.clone()),
        ] {
            assert_eq!(FlakeRef::parse(&slashed.to_string()).unwrap(), slashed);
        }
    }

    #[test]
    fn test_base_ref_clears_modifiers() {
        let r = FlakeRef::parse(&format!("git+https://x/foo?ref=v2&rev={}&dir=sub", REV)).unwrap();
        assert_eq!(r.base_ref(), FlakeRef::git("https://x/foo"));
    }

    #[test]
    fn test_rev_short() {
        let rev = Rev::parse(&REV.to_uppercase()).unwrap();
        assert_eq!(rev.as_str(), REV);
        assert_eq!(rev.short(), "0123456");
    }
}
