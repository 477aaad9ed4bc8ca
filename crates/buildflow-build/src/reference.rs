//! イメージ参照のパースと正規化
//!
//! `nginx` や `ghcr.io/org/app:v1.0` といった参照を
//! `docker.io/library/nginx` のような正規化済みの名前付き参照に変換します。

use crate::error::{BuildError, BuildResult};
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

/// レジストリが省略された場合のドメイン
pub const DEFAULT_DOMAIN: &str = "docker.io";

/// Docker Hub の旧ドメイン（DEFAULT_DOMAIN に正規化される）
pub const LEGACY_DEFAULT_DOMAIN: &str = "index.docker.io";

/// 公式イメージのリポジトリ接頭辞
pub const OFFICIAL_REPO_PREFIX: &str = "library/";

/// タグ省略時に付与されるタグ
pub const DEFAULT_TAG: &str = "latest";

const NAME_TOTAL_LENGTH_MAX: usize = 255;

const SHORT_ID_LENGTH: usize = 12;

static REFERENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    let alpha_numeric = r"[a-z0-9]+";
    let separator = r"(?:[._]|__|[-]*)";
    let name_component = format!("{alpha_numeric}(?:{separator}{alpha_numeric})*");
    let domain_component = r"(?:[a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9-]*[a-zA-Z0-9])";
    let domain = format!(r"{domain_component}(?:\.{domain_component})*(?::[0-9]+)?");
    let tag = r"[\w][\w.-]{0,127}";
    let digest = r"[A-Za-z][A-Za-z0-9]*(?:[-_+.][A-Za-z][A-Za-z0-9]*)*:[0-9a-fA-F]{32,}";
    let name = format!("(?:{domain}/)?{name_component}(?:/{name_component})*");
    Regex::new(&format!("^({name})(?::({tag}))?(?:@({digest}))?$"))
        .expect("reference grammar is a valid regex")
});

static IDENTIFIER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[a-f0-9]{64}$").expect("identifier pattern is a valid regex"));

/// 正規化済みの名前付き参照
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Named {
    domain: String,
    path: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl Named {
    /// レジストリのドメイン（例: "docker.io", "localhost:5000"）
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// ドメインを除いたリポジトリパス（例: "library/nginx"）
    pub fn path(&self) -> &str {
        &self.path
    }

    /// ドメイン込みのリポジトリ名（タグ・ダイジェストなし）
    pub fn name(&self) -> String {
        format!("{}/{}", self.domain, self.path)
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// タグもダイジェストも持たない参照か
    pub fn is_name_only(&self) -> bool {
        self.tag.is_none() && self.digest.is_none()
    }

    /// 名前のみの参照に `latest` タグを付与
    pub fn with_default_tag(mut self) -> Self {
        if self.is_name_only() {
            self.tag = Some(DEFAULT_TAG.to_string());
        }
        self
    }

    /// Docker Hub の省略形で表示
    ///
    /// # Examples
    /// - `docker.io/library/nginx:latest` -> `nginx:latest`
    /// - `docker.io/myuser/app` -> `myuser/app`
    /// - `ghcr.io/org/app:v1` -> `ghcr.io/org/app:v1`
    pub fn familiar(&self) -> String {
        let mut name = if self.domain == DEFAULT_DOMAIN {
            self.path
                .strip_prefix(OFFICIAL_REPO_PREFIX)
                .filter(|rest| !rest.contains('/'))
                .unwrap_or(&self.path)
                .to_string()
        } else {
            self.name()
        };
        if let Some(tag) = &self.tag {
            name.push(':');
            name.push_str(tag);
        }
        if let Some(digest) = &self.digest {
            name.push('@');
            name.push_str(digest);
        }
        name
    }
}

impl fmt::Display for Named {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.domain, self.path)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

/// 参照文字列をパースして正規化する
///
/// - `nginx` → `docker.io/library/nginx`
/// - `myuser/app:v1` → `docker.io/myuser/app:v1`
/// - `localhost:5000/app` → `localhost:5000/app`
/// - `index.docker.io/library/redis` → `docker.io/library/redis`
pub fn parse_normalized_named(s: &str) -> BuildResult<Named> {
    if s.is_empty() {
        return Err(BuildError::invalid_reference(s, "repository name must have at least one component"));
    }
    if IDENTIFIER_RE.is_match(s) {
        return Err(BuildError::invalid_reference(
            s,
            "cannot specify 64-byte hexadecimal strings",
        ));
    }

    let (domain, remainder) = split_docker_domain(s);

    let remote_name = remainder
        .split_once(':')
        .map(|(name, _)| name)
        .unwrap_or(&remainder);
    if remote_name.to_lowercase() != remote_name {
        return Err(BuildError::invalid_reference(s, "repository name must be lowercase"));
    }

    parse(&format!("{}/{}", domain, remainder)).map_err(|e| match e {
        BuildError::InvalidReference { reason, .. } => BuildError::invalid_reference(s, reason),
        other => other,
    })
}

/// 最初の `/` より前がレジストリかどうかを判定して分割
///
/// レジストリとみなす条件: `.` か `:` を含む、`localhost`、または大文字を含む
fn split_docker_domain(name: &str) -> (String, String) {
    let (mut domain, mut remainder) = match name.split_once('/') {
        Some((first, rest))
            if first.contains(['.', ':'])
                || first == "localhost"
                || first.to_lowercase() != first =>
        {
            (first.to_string(), rest.to_string())
        }
        _ => (DEFAULT_DOMAIN.to_string(), name.to_string()),
    };

    if domain == LEGACY_DEFAULT_DOMAIN {
        domain = DEFAULT_DOMAIN.to_string();
    }
    if domain == DEFAULT_DOMAIN && !remainder.contains('/') {
        remainder = format!("{}{}", OFFICIAL_REPO_PREFIX, remainder);
    }
    (domain, remainder)
}

/// ドメイン付きの完全な参照文字列をパース
fn parse(s: &str) -> BuildResult<Named> {
    let caps = REFERENCE_RE.captures(s).ok_or_else(|| {
        if REFERENCE_RE.is_match(&s.to_lowercase()) {
            BuildError::invalid_reference(s, "repository name must be lowercase")
        } else {
            BuildError::invalid_reference(s, "invalid reference format")
        }
    })?;

    let name = &caps[1];
    if name.len() > NAME_TOTAL_LENGTH_MAX {
        return Err(BuildError::invalid_reference(
            s,
            format!("repository name must not be more than {} characters", NAME_TOTAL_LENGTH_MAX),
        ));
    }

    let (domain, path) = name
        .split_once('/')
        .ok_or_else(|| BuildError::invalid_reference(s, "invalid reference format"))?;

    Ok(Named {
        domain: domain.to_string(),
        path: path.to_string(),
        tag: caps.get(2).map(|m| m.as_str().to_string()),
        digest: caps.get(3).map(|m| m.as_str().to_string()),
    })
}

/// イメージIDを表示用に短縮
///
/// `sha256:` などのアルゴリズム接頭辞を除き、先頭12文字を返す。
pub fn truncate_id(id: &str) -> &str {
    let id = id.split_once(':').map(|(_, hex)| hex).unwrap_or(id);
    match id.char_indices().nth(SHORT_ID_LENGTH) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}
