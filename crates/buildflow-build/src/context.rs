use crate::error::{BuildError, BuildResult};
use flate2::Compression;
use flate2::write::GzEncoder;
use glob::Pattern;
use std::fs;
use std::path::Path;
use tar::Builder;

/// アーカイブ内での Dockerfile 名
pub const DOCKERFILE_NAME: &str = "Dockerfile";

pub struct ContextBuilder;

impl ContextBuilder {
    /// ビルドコンテキストをtar.gzアーカイブとして作成
    ///
    /// `.dockerignore` に一致するファイルは除外し、
    /// 指定された Dockerfile をアーカイブ直下の `Dockerfile` として格納する。
    pub fn create_context(context_path: &Path, dockerfile_path: &Path) -> BuildResult<Vec<u8>> {
        tracing::debug!("Creating build context from: {}", context_path.display());

        if !context_path.is_dir() {
            return Err(BuildError::ContextNotFound(context_path.to_path_buf()));
        }
        if !dockerfile_path.is_file() {
            return Err(BuildError::DockerfileNotFound(dockerfile_path.to_path_buf()));
        }

        let ignore = DockerIgnore::load(context_path)?;

        let mut archive_data = Vec::new();
        {
            let encoder = GzEncoder::new(&mut archive_data, Compression::default());
            let mut tar = Builder::new(encoder);

            Self::append_dir(&mut tar, context_path, Path::new(""), &ignore)?;

            // Dockerfileを "Dockerfile" として追加
            let dockerfile_content = fs::read(dockerfile_path)?;

            let mut header = tar::Header::new_gnu();
            header.set_path(DOCKERFILE_NAME).map_err(|e| {
                BuildError::InvalidConfig(format!("Failed to set Dockerfile path: {}", e))
            })?;
            header.set_size(dockerfile_content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();

            tar.append(&header, &dockerfile_content[..])
                .map_err(BuildError::Io)?;

            tar.finish().map_err(BuildError::Io)?;
        }

        tracing::debug!("Build context created: {} bytes", archive_data.len());

        // コンテキストサイズの警告
        Self::check_context_size(archive_data.len());

        Ok(archive_data)
    }

    /// ディレクトリを再帰的に追加（除外パターンを適用）
    fn append_dir<W: std::io::Write>(
        tar: &mut Builder<W>,
        root: &Path,
        relative: &Path,
        ignore: &DockerIgnore,
    ) -> BuildResult<()> {
        let mut entries = fs::read_dir(root.join(relative))?.collect::<Result<Vec<_>, _>>()?;
        entries.sort_by_key(|entry| entry.file_name());

        for entry in entries {
            let rel_path = relative.join(entry.file_name());
            let rel_str = rel_path.to_string_lossy().replace('\\', "/");

            // 直下の Dockerfile は後から差し込むものと重複させない
            if rel_str == DOCKERFILE_NAME {
                continue;
            }
            if ignore.is_excluded(&rel_str) {
                tracing::debug!("Excluded by .dockerignore: {}", rel_str);
                continue;
            }

            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                tar.append_dir(&rel_path, entry.path())?;
                Self::append_dir(tar, root, &rel_path, ignore)?;
            } else {
                tar.append_path_with_name(entry.path(), &rel_path)?;
            }
        }
        Ok(())
    }

    /// コンテキストサイズのチェックと警告
    fn check_context_size(size: usize) {
        const MAX_CONTEXT_SIZE: usize = 500 * 1024 * 1024; // 500MB

        if size > MAX_CONTEXT_SIZE {
            tracing::warn!(
                "警告: ビルドコンテキストが大きすぎます（{}MB）\n\
                 .dockerignoreファイルで不要なファイルを除外することを推奨します。",
                size / 1024 / 1024
            );
        }
    }
}

/// `.dockerignore` の除外ルール
///
/// 後に書かれたルールが優先され、`!` で始まる行は除外の取り消し。
#[derive(Debug, Default)]
struct DockerIgnore {
    rules: Vec<(Pattern, bool)>,
}

impl DockerIgnore {
    fn load(context_path: &Path) -> BuildResult<Self> {
        let path = context_path.join(".dockerignore");
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::parse(&fs::read_to_string(path)?)
    }

    fn parse(content: &str) -> BuildResult<Self> {
        let mut rules = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (negated, pattern) = match line.strip_prefix('!') {
                Some(rest) => (true, rest.trim()),
                None => (false, line),
            };
            let pattern = pattern.trim_start_matches("./").trim_matches('/');
            let compiled = Pattern::new(pattern).map_err(|e| {
                BuildError::InvalidConfig(format!("Invalid .dockerignore pattern '{}': {}", line, e))
            })?;
            rules.push((compiled, negated));
        }
        Ok(Self { rules })
    }

    /// パス自身か、その親ディレクトリのいずれかが一致すれば除外
    fn is_excluded(&self, rel_path: &str) -> bool {
        let mut excluded = false;
        for (pattern, negated) in &self.rules {
            let matched = pattern.matches(rel_path)
                || rel_path
                    .match_indices('/')
                    .any(|(idx, _)| pattern.matches(&rel_path[..idx]));
            if matched {
                excluded = !negated;
            }
        }
        excluded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::tempdir;

    fn archive_entries(archive: Vec<u8>) -> HashSet<String> {
        let decoder = flate2::read::GzDecoder::new(std::io::Cursor::new(archive));
        let mut tar = tar::Archive::new(decoder);
        tar.entries()
            .unwrap()
            .map(|e| {
                e.unwrap()
                    .path()
                    .unwrap()
                    .to_string_lossy()
                    .trim_end_matches('/')
                    .to_string()
            })
            .collect()
    }

    #[test]
    fn test_create_context() {
        let temp_dir = tempdir().unwrap();

        // テスト用のファイル構造を作成
        fs::write(temp_dir.path().join("file1.txt"), "content1").unwrap();
        let subdir = temp_dir.path().join("subdir");
        fs::create_dir(&subdir).unwrap();
        fs::write(subdir.join("file2.txt"), "content2").unwrap();

        let dockerfile = temp_dir.path().join("build.Dockerfile");
        fs::write(&dockerfile, "FROM alpine\nRUN echo test").unwrap();

        let archive = ContextBuilder::create_context(temp_dir.path(), &dockerfile).unwrap();
        let entries = archive_entries(archive);

        assert!(entries.contains("Dockerfile"));
        assert!(entries.contains("file1.txt"));
        assert!(entries.contains("subdir/file2.txt"));
    }

    #[test]
    fn test_create_context_respects_dockerignore() {
        let temp_dir = tempdir().unwrap();
        fs::write(temp_dir.path().join(".dockerignore"), "# comment\ntarget\n*.log\n!keep.log\n").unwrap();
        fs::write(temp_dir.path().join("app.log"), "noise").unwrap();
        fs::write(temp_dir.path().join("keep.log"), "keep").unwrap();
        fs::create_dir(temp_dir.path().join("target")).unwrap();
        fs::write(temp_dir.path().join("target/big.bin"), "bin").unwrap();
        fs::write(temp_dir.path().join("main.rs"), "fn main() {}").unwrap();

        let dockerfile = temp_dir.path().join("Dockerfile");
        fs::write(&dockerfile, "FROM alpine").unwrap();

        let entries =
            archive_entries(ContextBuilder::create_context(temp_dir.path(), &dockerfile).unwrap());

        assert!(entries.contains("main.rs"));
        assert!(entries.contains("keep.log"));
        assert!(!entries.contains("app.log"));
        assert!(!entries.contains("target"));
        assert!(!entries.contains("target/big.bin"));
    }

    #[test]
    fn test_create_context_missing_dockerfile() {
        let temp_dir = tempdir().unwrap();
        let result =
            ContextBuilder::create_context(temp_dir.path(), &temp_dir.path().join("Dockerfile"));
        assert!(matches!(result, Err(BuildError::DockerfileNotFound(_))));
    }

    #[test]
    fn test_create_context_missing_dir() {
        let temp_dir = tempdir().unwrap();
        let missing = temp_dir.path().join("nope");
        let result = ContextBuilder::create_context(&missing, &missing.join("Dockerfile"));
        assert!(matches!(result, Err(BuildError::ContextNotFound(_))));
    }

    #[test]
    fn test_dockerignore_nested_match() {
        let ignore = DockerIgnore::parse("node_modules\n").unwrap();
        assert!(ignore.is_excluded("node_modules"));
        assert!(ignore.is_excluded("node_modules/lib/index.js"));
        assert!(!ignore.is_excluded("src/index.js"));
    }
}
