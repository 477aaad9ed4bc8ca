//! レイヤースカッシュ
//!
//! `docker save` 形式のアーカイブ（展開済みディレクトリ）を読み、
//! ベースイメージより上のレイヤーを1つにまとめた新しいアーカイブを作ります。
//! 作成したアーカイブは `docker load` でそのまま読み込めます。

use crate::error::{BuildError, BuildResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tar::{Archive, Builder, EntryType, Header};

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ManifestEntry {
    config: String,
    #[serde(default)]
    repo_tags: Option<Vec<String>>,
    layers: Vec<String>,
}

/// スカッシュ結果
pub(crate) struct SquashedImage {
    /// `sha256:<hex>` 形式のイメージID
    pub image_id: String,
    /// `docker load` 用の tar アーカイブ
    pub archive: Vec<u8>,
}

/// まとめたレイヤー内の1エントリ
struct LayerEntry {
    header: Header,
    data: Vec<u8>,
    link_name: Option<PathBuf>,
}

fn squash_err(message: impl Into<String>) -> BuildError {
    BuildError::SquashFailed(message.into())
}

/// 展開済みの保存イメージをスカッシュする
///
/// 先頭 `base_layers` 個のレイヤーはそのまま残し、残りを1レイヤーに統合する。
/// `comment` は追加する履歴エントリのコメント。
pub(crate) fn squash_saved_image(
    saved_dir: &Path,
    base_layers: usize,
    comment: &str,
    created: &str,
) -> BuildResult<SquashedImage> {
    let manifest_file = File::open(saved_dir.join("manifest.json"))?;
    let mut manifest: Vec<ManifestEntry> = serde_json::from_reader(BufReader::new(manifest_file))?;
    if manifest.is_empty() {
        return Err(squash_err("manifest.json has no images"));
    }
    let manifest = manifest.swap_remove(0);

    if base_layers > manifest.layers.len() {
        return Err(squash_err(format!(
            "base image has {} layers but image has only {}",
            base_layers,
            manifest.layers.len()
        )));
    }

    let config_file = File::open(saved_dir.join(&manifest.config))?;
    let mut config: serde_json::Value = serde_json::from_reader(BufReader::new(config_file))?;

    let layer_paths: Vec<PathBuf> = manifest.layers.iter().map(|l| saved_dir.join(l)).collect();
    let merged = merge_layers(&layer_paths[base_layers..], base_layers > 0)?;
    let diff_id = format!("sha256:{}", hex::encode(Sha256::digest(&merged)));
    tracing::debug!(
        "Merged {} layers into {} ({} bytes)",
        layer_paths.len() - base_layers,
        diff_id,
        merged.len()
    );

    rewrite_config(&mut config, base_layers, &diff_id, comment, created)?;
    let config_bytes = serde_json::to_vec(&config)?;
    let config_hex = hex::encode(Sha256::digest(&config_bytes));

    let mut archive = Builder::new(Vec::new());
    let mut layer_names = Vec::with_capacity(base_layers + 1);

    for (idx, path) in layer_paths[..base_layers].iter().enumerate() {
        let name = format!("layers/{}.tar", idx);
        archive.append_path_with_name(path, &name)?;
        layer_names.push(name);
    }
    let squashed_name = "layers/squashed.tar".to_string();
    append_bytes(&mut archive, &squashed_name, &merged)?;
    layer_names.push(squashed_name);

    let config_name = format!("{}.json", config_hex);
    append_bytes(&mut archive, &config_name, &config_bytes)?;

    let new_manifest = vec![ManifestEntry {
        config: config_name,
        repo_tags: None,
        layers: layer_names,
    }];
    append_bytes(&mut archive, "manifest.json", &serde_json::to_vec(&new_manifest)?)?;

    Ok(SquashedImage {
        image_id: format!("sha256:{}", config_hex),
        archive: archive.into_inner()?,
    })
}

fn append_bytes(archive: &mut Builder<Vec<u8>>, name: &str, data: &[u8]) -> BuildResult<()> {
    let mut header = Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    archive.append_data(&mut header, name, data)?;
    Ok(())
}

/// レイヤーを順に重ね、1つの tar にまとめる
///
/// `keep_whiteouts` が true の場合（ベースイメージがある場合）、
/// ベース側のファイルを隠すための whiteout を結果に残す。
fn merge_layers(layers: &[PathBuf], keep_whiteouts: bool) -> BuildResult<Vec<u8>> {
    let mut entries: BTreeMap<String, LayerEntry> = BTreeMap::new();

    for layer in layers {
        let reader = open_layer(layer)?;
        let mut archive = Archive::new(reader);
        for entry in archive.entries()? {
            let mut entry = entry?;
            if matches!(
                entry.header().entry_type(),
                EntryType::XGlobalHeader
                    | EntryType::XHeader
                    | EntryType::GNULongName
                    | EntryType::GNULongLink
            ) {
                continue;
            }
            let path = normalize(&entry.path()?.to_string_lossy());
            if path.is_empty() {
                continue;
            }
            let (parent, name) = split_parent(&path);

            if name == OPAQUE_WHITEOUT {
                remove_children(&mut entries, parent);
                if keep_whiteouts {
                    entries.insert(path, whiteout_entry());
                }
                continue;
            }
            if let Some(target) = name.strip_prefix(WHITEOUT_PREFIX) {
                let target = join(parent, target);
                entries.remove(&target);
                remove_children(&mut entries, &target);
                if keep_whiteouts {
                    entries.insert(path, whiteout_entry());
                }
                continue;
            }

            // 同じパスを消していた whiteout は不要になる
            entries.remove(&join(parent, &format!("{}{}", WHITEOUT_PREFIX, name)));

            let header = entry.header().clone();
            let is_dir = header.entry_type() == EntryType::Directory;
            if !is_dir {
                remove_children(&mut entries, &path);
            }
            let link_name = entry.link_name()?.map(|l| l.into_owned());
            let mut data = Vec::new();
            if header.entry_type() == EntryType::Regular || header.entry_type() == EntryType::Continuous {
                entry.read_to_end(&mut data)?;
            }
            entries.insert(
                path,
                LayerEntry {
                    header,
                    data,
                    link_name,
                },
            );
        }
    }

    let mut builder = Builder::new(Vec::new());
    // ハードリンクは参照先より後に書き出す
    let (links, others): (Vec<_>, Vec<_>) = entries
        .into_iter()
        .partition(|(_, e)| e.header.entry_type() == EntryType::Link);

    for (path, mut entry) in others.into_iter().chain(links) {
        match entry.link_name {
            Some(target) => {
                entry.header.set_size(0);
                builder.append_link(&mut entry.header, &path, &target)?;
            }
            None => {
                entry.header.set_size(entry.data.len() as u64);
                builder.append_data(&mut entry.header, &path, entry.data.as_slice())?;
            }
        }
    }
    Ok(builder.into_inner()?)
}

fn open_layer(path: &Path) -> BuildResult<Box<dyn Read>> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 2];
    let n = file.read(&mut magic)?;
    let file = File::open(path)?;
    if n == 2 && magic == [0x1f, 0x8b] {
        Ok(Box::new(flate2::read::GzDecoder::new(BufReader::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

fn whiteout_entry() -> LayerEntry {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_mode(0o644);
    header.set_size(0);
    LayerEntry {
        header,
        data: Vec::new(),
        link_name: None,
    }
}

fn normalize(path: &str) -> String {
    path.trim_start_matches("./")
        .trim_start_matches('/')
        .trim_end_matches('/')
        .to_string()
}

fn split_parent(path: &str) -> (&str, &str) {
    path.rsplit_once('/').unwrap_or(("", path))
}

fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

/// `dir` 配下のエントリを全て取り除く（`dir` 自身は残す）
fn remove_children(entries: &mut BTreeMap<String, LayerEntry>, dir: &str) {
    if dir.is_empty() {
        entries.clear();
        return;
    }
    let prefix = format!("{}/", dir);
    entries.retain(|path, _| !path.starts_with(&prefix));
}

/// 設定の rootfs と履歴を書き換える
fn rewrite_config(
    config: &mut serde_json::Value,
    base_layers: usize,
    diff_id: &str,
    comment: &str,
    created: &str,
) -> BuildResult<()> {
    let object = config
        .as_object_mut()
        .ok_or_else(|| squash_err("image config is not a JSON object"))?;

    let diff_ids: Vec<serde_json::Value> = object
        .get("rootfs")
        .and_then(|r| r.get("diff_ids"))
        .and_then(|d| d.as_array())
        .ok_or_else(|| squash_err("image config has no rootfs.diff_ids"))?
        .iter()
        .take(base_layers)
        .cloned()
        .chain(std::iter::once(serde_json::Value::from(diff_id)))
        .collect();

    object.insert(
        "rootfs".to_string(),
        serde_json::json!({ "type": "layers", "diff_ids": diff_ids }),
    );

    // ベースのレイヤーに対応する履歴だけを残す
    let mut history: Vec<serde_json::Value> = Vec::new();
    let mut seen_layers = 0;
    if let Some(entries) = object.get("history").and_then(|h| h.as_array()) {
        for entry in entries {
            let empty = entry
                .get("empty_layer")
                .and_then(|e| e.as_bool())
                .unwrap_or(false);
            if !empty {
                if seen_layers == base_layers {
                    break;
                }
                seen_layers += 1;
            }
            history.push(entry.clone());
        }
    }
    history.push(serde_json::json!({
        "created": created,
        "created_by": "",
        "comment": comment,
    }));
    object.insert("history".to_string(), serde_json::Value::from(history));
    object.insert("created".to_string(), serde_json::Value::from(created));
    object.remove("id");
    object.remove("parent");

    Ok(())
}
