//! The transform engine: a state machine over one live document with
//! commit-or-revert semantics for every mutation.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::document::codec::{self, DirResolver, NoResolver, ResourceResolver};
use crate::document::{Document, DocumentStats, TextureDescriptor, TexturePayload};
use crate::foundation::error::{MeshpressError, MeshpressResult};
use crate::foundation::progress::{self, ProgressEvent, ProgressFn};
use crate::scene::SceneGraph;

pub mod dedup;
pub mod normals;
pub mod quantize;
pub mod simplify;
pub mod textures;

pub use dedup::DedupOptions;
pub use normals::NormalsOptions;
pub use quantize::QuantizeOptions;
pub use simplify::SimplifyOptions;
pub use textures::{TextureBackend, TextureCompressionOptions, TextureTarget};

/// Per-stage options for [`Optimizer::optimize_all`]. `None` skips a stage;
/// there is no distinction between an explicit skip and an omitted key.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizeAllOptions {
    pub simplify: Option<SimplifyOptions>,
    pub deduplicate: Option<DedupOptions>,
    pub quantize: Option<QuantizeOptions>,
    pub normals: Option<NormalsOptions>,
    pub textures: Option<TextureCompressionOptions>,
}

impl OptimizeAllOptions {
    /// Whether any stage is enabled.
    pub fn any_enabled(&self) -> bool {
        self.simplify.is_some()
            || self.deduplicate.is_some()
            || self.quantize.is_some()
            || self.normals.is_some()
            || self.textures.is_some()
    }
}

/// Before/after structural statistics plus byte sizes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OptimizationReport {
    pub original_size: u64,
    pub optimized_size: u64,
    /// `optimized_size / original_size`.
    pub compression_ratio: f64,
    /// Names of the transforms that committed, in order. Reverted
    /// transforms are absent.
    pub applied_optimizations: Vec<String>,
    pub stats: ReportStats,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ReportStats {
    pub before: DocumentStats,
    pub after: DocumentStats,
}

struct Baseline {
    size: u64,
    stats: DocumentStats,
}

/// Holds zero or one live document and applies transforms to it.
///
/// Every mutating call runs on a private clone; the clone only replaces the
/// live document when its serialized size did not grow. Distinct optimizer
/// instances are fully independent.
#[derive(Default)]
pub struct Optimizer {
    doc: Option<Document>,
    baseline: Option<Baseline>,
    applied: Vec<String>,
    progress: Option<ProgressFn>,
}

impl Optimizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a progress callback, scoped to this instance. The callback
    /// is invoked synchronously and must not block.
    pub fn on_progress(&mut self, callback: impl FnMut(&ProgressEvent) + 'static) {
        self.progress = Some(Box::new(callback));
    }

    /// Whether a document is currently loaded.
    pub fn is_loaded(&self) -> bool {
        self.doc.is_some()
    }

    /// Load from a file on disk. `.gltf`/`.json` files parse as JSON with
    /// sibling files resolving external URIs; anything else parses as GLB.
    pub fn load_from_path(&mut self, path: impl AsRef<Path>) -> MeshpressResult<()> {
        let path = path.as_ref();
        self.emit("load", 10, Some(&format!("Reading {}", path.display())));
        let bytes = std::fs::read(path)?;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        let doc = match extension.as_deref() {
            Some("gltf") | Some("json") => {
                let json: serde_json::Value = serde_json::from_slice(&bytes)?;
                let base = path.parent().unwrap_or_else(|| Path::new("."));
                codec::read_json(&json, &DirResolver::new(base))?
            }
            _ => codec::read_binary(&bytes)?,
        };
        self.install(doc, bytes.len() as u64);
        self.emit("load", 100, Some("Document loaded"));
        Ok(())
    }

    /// Load from an in-memory buffer. GLB is detected by magic; anything
    /// else must be self-contained glTF JSON (`data:` URI resources).
    pub fn load_from_bytes(&mut self, name: &str, bytes: &[u8]) -> MeshpressResult<()> {
        self.emit("load", 10, Some(&format!("Decoding {name}")));
        let doc = if bytes.len() >= 4 && &bytes[0..4] == b"glTF" {
            codec::read_binary(bytes)?
        } else {
            let json: serde_json::Value = serde_json::from_slice(bytes).map_err(|e| {
                MeshpressError::format(format!("'{name}' is neither GLB nor glTF JSON: {e}"))
            })?;
            codec::read_json(&json, &NoResolver)?
        };
        self.install(doc, bytes.len() as u64);
        self.emit("load", 100, Some("Document loaded"));
        Ok(())
    }

    /// Load from glTF JSON with caller-provided resource resolution.
    pub fn load_from_json(
        &mut self,
        json: &serde_json::Value,
        resolver: &dyn ResourceResolver,
    ) -> MeshpressResult<()> {
        let doc = codec::read_json(json, resolver)?;
        let size = codec::write_binary(&doc)?.len() as u64;
        self.install(doc, size);
        self.emit("load", 100, Some("Document loaded"));
        Ok(())
    }

    /// Load by encoding a live scene graph into a document.
    pub fn load_from_scene(&mut self, scene: &SceneGraph) -> MeshpressResult<()> {
        self.emit("load", 10, Some("Encoding scene graph"));
        let doc = crate::scene::scene_to_document(scene)?;
        let size = codec::write_binary(&doc)?.len() as u64;
        self.install(doc, size);
        self.emit("load", 100, Some("Document loaded"));
        Ok(())
    }

    fn install(&mut self, doc: Document, original_size: u64) {
        self.baseline = Some(Baseline {
            size: original_size,
            stats: doc.stats(),
        });
        self.doc = Some(doc);
        self.applied.clear();
    }

    /// Drop the live document and all captured state.
    pub fn reset(&mut self) {
        self.doc = None;
        self.baseline = None;
        self.applied.clear();
    }

    /// Borrow the live document.
    pub fn document(&self) -> MeshpressResult<&Document> {
        self.doc.as_ref().ok_or_else(Self::not_loaded)
    }

    /// Read-only texture descriptors of the live document.
    pub fn texture_descriptors(&self) -> MeshpressResult<Vec<TextureDescriptor>> {
        Ok(self.document()?.texture_descriptors())
    }

    /// Extract texture payloads for the offload protocol.
    pub fn texture_payloads(&self) -> MeshpressResult<Vec<TexturePayload>> {
        Ok(self.document()?.texture_payloads())
    }

    fn not_loaded() -> MeshpressError {
        MeshpressError::illegal_state("no document is loaded; call a load operation first")
    }

    fn emit(&mut self, operation: &str, percent: u8, details: Option<&str>) {
        progress::emit(&mut self.progress, operation, percent, details);
    }

    /// Transactional apply: clone, measure, transform, re-measure, then
    /// commit or revert.
    ///
    /// The reserialize-and-compare is the correctness mechanism for the
    /// size guarantee; it also captures effects an in-memory estimate would
    /// miss (buffer sharing, index widths). A regression is not an error:
    /// the caller sees success and the transform is simply absent from the
    /// applied list.
    fn apply<F>(&mut self, transform: F) -> MeshpressResult<()>
    where
        F: FnOnce(&mut Document) -> MeshpressResult<String>,
    {
        let live = self.doc.as_ref().ok_or_else(Self::not_loaded)?;
        let size_before = codec::write_binary(live)?.len();

        let mut scratch = live.clone();
        let name = transform(&mut scratch)?;
        let size_after = codec::write_binary(&scratch)?.len();

        if size_after > size_before {
            tracing::warn!(
                %name,
                size_before,
                size_after,
                "transform increased serialized size and was reverted"
            );
            return Ok(());
        }

        self.doc = Some(scratch);
        self.applied.push(name);
        Ok(())
    }

    /// Weld vertices, then reduce triangle count to the requested ratio.
    pub fn simplify(&mut self, opts: &SimplifyOptions) -> MeshpressResult<()> {
        self.apply(|doc| {
            simplify::simplify(doc, opts)?;
            Ok("simplify".to_owned())
        })
    }

    /// Merge duplicate textures, materials, meshes and attribute streams.
    pub fn deduplicate(&mut self, opts: &DedupOptions) -> MeshpressResult<()> {
        self.apply(|doc| {
            dedup::deduplicate(doc, opts)?;
            Ok("deduplicate".to_owned())
        })
    }

    /// Reduce vertex attribute storage to the requested bit depths.
    pub fn quantize(&mut self, opts: &QuantizeOptions) -> MeshpressResult<()> {
        self.apply(|doc| {
            quantize::quantize(doc, opts)?;
            Ok("quantize".to_owned())
        })
    }

    /// Recompute smooth vertex normals.
    pub fn optimize_normals(&mut self, opts: &NormalsOptions) -> MeshpressResult<()> {
        self.apply(|doc| {
            normals::optimize_normals(doc, opts)?;
            Ok("optimize normals".to_owned())
        })
    }

    /// Recompress textures locally or through the offload protocol.
    ///
    /// Per-texture failures are warnings; the call fails only when every
    /// texture failed and the basic fallback achieved nothing.
    pub fn compress_textures(&mut self, opts: &TextureCompressionOptions) -> MeshpressResult<()> {
        self.apply(|doc| {
            let before_textures = doc.textures.clone();
            let outcome = textures::compress_textures(doc, opts)?;
            tracing::debug!(
                succeeded = outcome.succeeded,
                failed = outcome.failed.len(),
                "texture compression pass finished"
            );

            if !outcome.failed.is_empty() {
                let indices: Vec<String> = outcome
                    .failed
                    .iter()
                    .map(|(index, _)| index.to_string())
                    .collect();
                tracing::warn!(
                    failed = %indices.join(", "),
                    "textures skipped during compression"
                );
            }

            if outcome.used_fallback {
                if doc.textures == before_textures {
                    let reasons: Vec<String> = outcome
                        .failed
                        .iter()
                        .map(|(index, reason)| format!("texture {index}: {reason}"))
                        .collect();
                    return Err(MeshpressError::AggregateFailure(reasons.join("; ")));
                }
                return Ok("basic texture optimization".to_owned());
            }

            Ok("texture compression".to_owned())
        })
    }

    /// Run the enabled stages in fixed order: simplify, dedup, quantize,
    /// normals, textures. One progress tick per stage boundary.
    pub fn optimize_all(&mut self, opts: &OptimizeAllOptions) -> MeshpressResult<()> {
        if !self.is_loaded() {
            return Err(Self::not_loaded());
        }

        let enabled = [
            opts.simplify.is_some(),
            opts.deduplicate.is_some(),
            opts.quantize.is_some(),
            opts.normals.is_some(),
            opts.textures.is_some(),
        ]
        .iter()
        .filter(|&&e| e)
        .count();
        if enabled == 0 {
            self.emit("optimize", 100, Some("No stages enabled"));
            return Ok(());
        }

        let tick_percent = |done: usize| (done * 100 / enabled) as u8;
        let mut done = 0usize;

        if let Some(simplify_opts) = opts.simplify {
            self.emit("optimize", tick_percent(done), Some("simplify"));
            self.simplify(&simplify_opts)?;
            done += 1;
        }
        if let Some(dedup_opts) = opts.deduplicate {
            self.emit("optimize", tick_percent(done), Some("deduplicate"));
            self.deduplicate(&dedup_opts)?;
            done += 1;
        }
        if let Some(quantize_opts) = opts.quantize {
            self.emit("optimize", tick_percent(done), Some("quantize"));
            self.quantize(&quantize_opts)?;
            done += 1;
        }
        if let Some(normals_opts) = opts.normals {
            self.emit("optimize", tick_percent(done), Some("normals"));
            self.optimize_normals(&normals_opts)?;
            done += 1;
        }
        if let Some(texture_opts) = &opts.textures {
            let texture_opts = texture_opts.clone();
            self.emit("optimize", tick_percent(done), Some("textures"));
            self.compress_textures(&texture_opts)?;
        }

        self.emit("optimize", 100, Some("Optimization completed"));
        Ok(())
    }

    /// Diff the load-time baseline against the current document.
    pub fn report(&self) -> MeshpressResult<OptimizationReport> {
        let doc = self.doc.as_ref().ok_or_else(Self::not_loaded)?;
        let baseline = self.baseline.as_ref().ok_or_else(Self::not_loaded)?;
        let optimized_size = codec::write_binary(doc)?.len() as u64;
        Ok(OptimizationReport {
            original_size: baseline.size,
            optimized_size,
            compression_ratio: if baseline.size > 0 {
                optimized_size as f64 / baseline.size as f64
            } else {
                1.0
            },
            applied_optimizations: self.applied.clone(),
            stats: ReportStats {
                before: baseline.stats,
                after: doc.stats(),
            },
        })
    }
}
