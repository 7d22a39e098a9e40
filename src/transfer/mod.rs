//! The scene transfer payload: the stable wire shape used to move a
//! document plus its externalized assets (and opaque viewer settings)
//! between processes, without a live document instance.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::document::codec::{self, MapResolver};
use crate::document::{Document, mime_for_name};
use crate::export::GltfExport;
use crate::foundation::error::{MeshpressError, MeshpressResult};

/// Asset bytes on the wire: either standard base64 or a raw byte array.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransferBytes {
    Base64(String),
    Raw(Vec<u8>),
}

/// One externalized asset, keyed by file name in the payload map.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferAsset {
    pub data: TransferBytes,
    pub file_name: String,
    pub mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

impl TransferAsset {
    /// Build a base64-encoded entry.
    pub fn from_bytes(file_name: impl Into<String>, bytes: &[u8]) -> Self {
        let file_name = file_name.into();
        let mime_type = mime_for_name(&file_name);
        Self {
            data: TransferBytes::Base64(BASE64.encode(bytes)),
            file_name,
            mime_type,
            encoding: Some("base64".to_owned()),
        }
    }

    /// Decode the carried bytes, honoring the entry's encoding.
    pub fn decoded(&self) -> MeshpressResult<Vec<u8>> {
        match &self.data {
            TransferBytes::Raw(bytes) => Ok(bytes.clone()),
            TransferBytes::Base64(text) => BASE64.decode(text).map_err(|e| {
                MeshpressError::format(format!(
                    "asset '{}' carries malformed base64 data: {e}",
                    self.file_name
                ))
            }),
        }
    }
}

/// The externally-persisted/transmitted representation of a document.
///
/// `gltf_json`'s `buffers[].uri` and `images[].uri` entries (when not
/// `data:` URIs) resolve against `asset_data` by exact name or basename —
/// that match is the join key between the document and its assets. Viewer
/// settings ride along as opaque JSON the core never interprets.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneTransferPayload {
    pub gltf_json: serde_json::Value,
    #[serde(default)]
    pub asset_data: BTreeMap<String, TransferAsset>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub camera: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub controls: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shadows: Option<serde_json::Value>,
}

impl SceneTransferPayload {
    /// Build a payload from a glTF export, base64-encoding every asset.
    pub fn from_gltf_export(export: &GltfExport) -> Self {
        let asset_data = export
            .assets
            .iter()
            .map(|(name, bytes)| (name.clone(), TransferAsset::from_bytes(name.clone(), bytes)))
            .collect();
        Self {
            gltf_json: export.json.clone(),
            asset_data,
            ..Self::default()
        }
    }

    /// Reconstruct the document in memory, resolving URIs against the
    /// asset map.
    pub fn to_document(&self) -> MeshpressResult<Document> {
        let mut entries = BTreeMap::new();
        for (key, asset) in &self.asset_data {
            let bytes = asset.decoded()?;
            // Both the map key and the declared file name can be the match
            // target.
            entries.entry(key.clone()).or_insert_with(|| bytes.clone());
            entries.entry(asset.file_name.clone()).or_insert(bytes);
        }
        codec::read_json(&self.gltf_json, &MapResolver::new(entries))
    }

    /// Write the payload to a directory as `{base_name}.gltf` plus one
    /// file per asset. Returns the JSON path.
    pub fn write_to_dir(
        &self,
        dir: impl AsRef<Path>,
        base_name: &str,
    ) -> MeshpressResult<PathBuf> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        for asset in self.asset_data.values() {
            std::fs::write(dir.join(&asset.file_name), asset.decoded()?)?;
        }
        let json_path = dir.join(format!("{base_name}.gltf"));
        std::fs::write(&json_path, serde_json::to_vec_pretty(&self.gltf_json)?)?;
        Ok(json_path)
    }

    /// File names referenced by the document's buffer and image URIs,
    /// excluding `data:` URIs.
    pub fn referenced_asset_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for key in ["buffers", "images"] {
            if let Some(entries) = self.gltf_json.get(key).and_then(|v| v.as_array()) {
                for entry in entries {
                    if let Some(uri) = entry.get("uri").and_then(|v| v.as_str())
                        && !uri.starts_with("data:")
                    {
                        names.push(uri.to_owned());
                    }
                }
            }
        }
        names
    }
}
