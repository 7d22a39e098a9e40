//! Export a document (or a live scene graph) to GLB, glTF + assets, or a
//! ZIP archive.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::Path;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::document::codec;
use crate::document::Document;
use crate::foundation::error::{MeshpressError, MeshpressResult};
use crate::foundation::progress::{self, ProgressEvent, ProgressFn};
use crate::scene::SceneGraph;

/// A GLB export: one self-contained binary.
#[derive(Clone, Debug)]
pub struct GlbExport {
    pub data: Vec<u8>,
    pub size: u64,
    pub export_time_ms: u64,
}

/// A glTF export: the JSON document plus named external assets. The
/// primary JSON is not part of the asset map.
#[derive(Clone, Debug)]
pub struct GltfExport {
    pub json: serde_json::Value,
    pub size: u64,
    pub export_time_ms: u64,
    pub assets: BTreeMap<String, Vec<u8>>,
}

/// Tagged union over the two export shapes. Immutable once produced.
#[derive(Clone, Debug)]
pub enum ExportResult {
    Glb(GlbExport),
    Gltf(GltfExport),
}

impl ExportResult {
    /// Total serialized size in bytes.
    pub fn size(&self) -> u64 {
        match self {
            Self::Glb(glb) => glb.size,
            Self::Gltf(gltf) => gltf.size,
        }
    }

    /// Wall-clock export duration in milliseconds.
    pub fn export_time_ms(&self) -> u64 {
        match self {
            Self::Glb(glb) => glb.export_time_ms,
            Self::Gltf(gltf) => gltf.export_time_ms,
        }
    }
}

/// Requested output shape for an export.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Glb,
    Gltf,
}

/// Serializes documents and scene graphs, reporting discrete progress
/// stages through a registered callback.
#[derive(Default)]
pub struct Exporter {
    progress: Option<ProgressFn>,
}

impl Exporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a progress callback, scoped to this instance.
    pub fn on_progress(&mut self, callback: impl FnMut(&ProgressEvent) + 'static) {
        self.progress = Some(Box::new(callback));
    }

    fn emit(&mut self, operation: &str, percent: u8, details: &str) {
        progress::emit(&mut self.progress, operation, percent, Some(details));
    }

    /// Serialize a document to GLB.
    pub fn export_document_glb(&mut self, doc: &Document) -> MeshpressResult<GlbExport> {
        let started = Instant::now();
        self.emit("export", 50, "Serializing document");
        let data = codec::write_binary(doc)?;
        let size = data.len() as u64;
        self.emit("export", 100, "Export completed");
        Ok(GlbExport {
            data,
            size,
            export_time_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Serialize a document to glTF JSON plus a named asset map.
    pub fn export_document_gltf(&mut self, doc: &Document) -> MeshpressResult<GltfExport> {
        let started = Instant::now();
        self.emit("export", 50, "Serializing document");
        let (json, assets) = codec::write_json(doc)?;
        let json_size = serde_json::to_vec(&json)?.len() as u64;
        let size = json_size + assets.values().map(|bytes| bytes.len() as u64).sum::<u64>();
        self.emit("export", 100, "Export completed");
        Ok(GltfExport {
            json,
            size,
            export_time_ms: started.elapsed().as_millis() as u64,
            assets,
        })
    }

    /// Export directly from a live scene graph, bypassing the optimizer.
    pub fn export_scene_glb(&mut self, scene: &SceneGraph) -> MeshpressResult<GlbExport> {
        self.emit("export", 10, "Encoding scene graph");
        let doc = crate::scene::scene_to_document(scene)?;
        self.export_document_glb(&doc)
    }

    /// Export a live scene graph as glTF JSON plus assets.
    pub fn export_scene_gltf(&mut self, scene: &SceneGraph) -> MeshpressResult<GltfExport> {
        self.emit("export", 10, "Encoding scene graph");
        let doc = crate::scene::scene_to_document(scene)?;
        self.export_document_gltf(&doc)
    }

    /// Bundle a glTF export into one ZIP archive: `{base_name}.gltf` plus
    /// every asset.
    pub fn create_zip_archive(
        &mut self,
        export: &GltfExport,
        base_name: &str,
    ) -> MeshpressResult<Vec<u8>> {
        self.emit("export", 50, "Packaging archive");
        let cursor = std::io::Cursor::new(Vec::new());
        let mut writer = zip::ZipWriter::new(cursor);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);

        let json_bytes = serde_json::to_vec_pretty(&export.json)?;
        writer
            .start_file(format!("{base_name}.gltf"), options)
            .map_err(|e| MeshpressError::export(format!("zip entry failed: {e}")))?;
        writer
            .write_all(&json_bytes)
            .map_err(|e| MeshpressError::export(format!("zip write failed: {e}")))?;

        for (name, bytes) in &export.assets {
            writer
                .start_file(name.clone(), options)
                .map_err(|e| MeshpressError::export(format!("zip entry failed: {e}")))?;
            writer
                .write_all(bytes)
                .map_err(|e| MeshpressError::export(format!("zip write failed: {e}")))?;
        }

        let cursor = writer
            .finish()
            .map_err(|e| MeshpressError::export(format!("zip finalize failed: {e}")))?;
        self.emit("export", 100, "Archive completed");
        Ok(cursor.into_inner())
    }

    /// Write an export to disk. GLB becomes one file; glTF becomes a JSON
    /// file plus one file per asset in the same directory.
    pub fn save_to_file(
        &mut self,
        result: &ExportResult,
        path: impl AsRef<Path>,
    ) -> MeshpressResult<()> {
        let path = path.as_ref();
        ensure_parent_dir(path)?;
        match result {
            ExportResult::Glb(glb) => {
                self.emit("export", 50, "Writing binary");
                std::fs::write(path, &glb.data)?;
            }
            ExportResult::Gltf(gltf) => {
                self.emit("export", 50, "Writing document and assets");
                let json_bytes = serde_json::to_vec_pretty(&gltf.json)?;
                std::fs::write(path, json_bytes)?;
                let dir = path.parent().unwrap_or_else(|| Path::new("."));
                for (name, bytes) in &gltf.assets {
                    std::fs::write(dir.join(name), bytes)?;
                }
            }
        }
        self.emit("export", 100, "Export completed");
        Ok(())
    }
}

/// Ensure the parent directory of `path` exists.
fn ensure_parent_dir(path: &Path) -> MeshpressResult<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        use anyhow::Context as _;
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create output directory '{}'", parent.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Mesh, Node, Primitive, Scene, Texture};

    fn textured_document() -> Document {
        Document {
            scenes: vec![Scene {
                name: None,
                nodes: vec![0],
            }],
            default_scene: Some(0),
            nodes: vec![Node {
                mesh: Some(0),
                ..Node::default()
            }],
            meshes: vec![Mesh {
                name: None,
                primitives: vec![Primitive {
                    positions: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
                    indices: vec![0, 1, 2],
                    ..Primitive::default()
                }],
            }],
            textures: vec![Texture {
                name: Some("albedo".into()),
                mime_type: "image/png".into(),
                image: vec![7; 32],
                sampler: None,
            }],
            ..Document::default()
        }
    }

    #[test]
    fn glb_export_reports_size_matching_data() {
        let mut exporter = Exporter::new();
        let export = exporter
            .export_document_glb(&textured_document())
            .expect("glb");
        assert_eq!(export.size, export.data.len() as u64);
        assert_eq!(&export.data[0..4], b"glTF");
    }

    #[test]
    fn gltf_export_splits_assets_excluding_primary_json() {
        let mut exporter = Exporter::new();
        let export = exporter
            .export_document_gltf(&textured_document())
            .expect("gltf");
        assert!(export.assets.contains_key("buffer0.bin"));
        assert!(export.assets.contains_key("albedo.png"));
        assert!(export.assets.keys().all(|name| !name.ends_with(".gltf")));
        let asset_total: u64 = export.assets.values().map(|b| b.len() as u64).sum();
        assert!(export.size > asset_total);
    }

    #[test]
    fn zip_archive_contains_json_and_every_asset() {
        let mut exporter = Exporter::new();
        let export = exporter
            .export_document_gltf(&textured_document())
            .expect("gltf");
        let archive_bytes = exporter
            .create_zip_archive(&export, "model")
            .expect("zip");

        let mut archive =
            zip::ZipArchive::new(std::io::Cursor::new(archive_bytes)).expect("read zip");
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_owned())
            .collect();
        assert!(names.contains(&"model.gltf".to_owned()));
        assert!(names.contains(&"buffer0.bin".to_owned()));
        assert!(names.contains(&"albedo.png".to_owned()));
        assert_eq!(names.len(), 1 + export.assets.len());
    }

    #[test]
    fn progress_reports_discrete_named_stages() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = events.clone();
        let mut exporter = Exporter::new();
        exporter.on_progress(move |event| sink.borrow_mut().push(event.clone()));
        exporter
            .export_document_glb(&textured_document())
            .expect("glb");

        let events = events.borrow();
        assert_eq!(events[0].details.as_deref(), Some("Serializing document"));
        assert_eq!(events[0].progress, 50);
        assert_eq!(events.last().unwrap().details.as_deref(), Some("Export completed"));
        assert_eq!(events.last().unwrap().progress, 100);
    }
}
