//! meshpress optimizes 3D scene-description documents for transport.
//!
//! Load a glTF/GLB asset (from disk, a raw buffer, or a live scene graph),
//! apply size-reducing transforms under a commit-or-revert guard that
//! reverts any transform that would grow the serialized document, then
//! re-export as GLB, glTF plus assets, or a ZIP archive. Texture
//! recompression can run in-process or be offloaded to a remote HTTP
//! worker with retries and per-response identity verification.
//!
//! The one-shot API is [`process_model`]; the pieces compose individually:
//!
//! - [`Optimizer`] — the transform engine over one live [`Document`]
//! - [`Exporter`] — GLB/glTF/ZIP serialization
//! - [`TextureOffloadClient`] — the remote recompression protocol
//! - [`SceneTransferPayload`] — the wire shape for document + assets
#![forbid(unsafe_code)]

pub mod document;
mod foundation;
pub mod export;
pub mod offload;
pub mod optimize;
pub mod pipeline;
pub mod scene;
pub mod transfer;

pub use crate::document::codec::{
    DirResolver, MapResolver, NoResolver, ResourceResolver, read_binary, read_json, write_binary,
    write_json,
};
pub use crate::document::{
    Document, DocumentStats, TextureDescriptor, TexturePayload,
};
pub use crate::export::{ExportFormat, ExportResult, Exporter, GlbExport, GltfExport};
pub use crate::foundation::error::{MeshpressError, MeshpressResult};
pub use crate::foundation::progress::{PipelineStage, ProgressEvent, StageProgress};
pub use crate::offload::{
    OffloadBatch, OffloadConfig, OffloadRequest, RecompressedTexture, TextureFailure,
    TextureOffloadClient,
};
pub use crate::optimize::{
    DedupOptions, NormalsOptions, OptimizationReport, OptimizeAllOptions, Optimizer,
    QuantizeOptions, ReportStats, SimplifyOptions, TextureBackend, TextureCompressionOptions,
    TextureTarget,
};
pub use crate::pipeline::{ExportOptions, LoadInput, ProcessOptions, process_model};
pub use crate::scene::{SceneGraph, SceneMaterial, SceneMesh, SceneNode, SceneTexture};
pub use crate::transfer::{SceneTransferPayload, TransferAsset, TransferBytes};
