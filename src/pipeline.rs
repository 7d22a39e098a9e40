//! The processing orchestrator: one call chaining load → optimize →
//! export with unified, stage-tagged progress.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::document::{Document, mime_for_name};
use crate::export::{ExportFormat, ExportResult, Exporter};
use crate::foundation::error::MeshpressResult;
use crate::foundation::progress::{PipelineStage, StageProgress};
use crate::optimize::{OptimizeAllOptions, Optimizer};
use crate::scene::SceneGraph;

/// Where the model comes from.
#[derive(Clone, Debug)]
pub enum LoadInput {
    /// A GLB or glTF file on disk.
    FromPath(PathBuf),
    /// A raw buffer plus its original file name.
    FromBuffer { name: String, data: Vec<u8> },
    /// A live renderer scene graph.
    FromScene(SceneGraph),
}

/// Export-side options for [`process_model`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExportOptions {
    pub format: ExportFormat,
    /// Replacement image bytes keyed by texture file name, spliced over
    /// matching textures before export.
    pub modified_texture_resources: Option<BTreeMap<String, Vec<u8>>>,
}

/// Combined options for one [`process_model`] call.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessOptions {
    pub optimize: OptimizeAllOptions,
    pub export: ExportOptions,
}

/// Load a model, run the requested transforms in fixed order, and export.
///
/// Sub-component progress is forwarded tagged with its stage. A
/// scene-graph input skips the document round-trip only when no
/// optimization stage is requested.
#[tracing::instrument(skip_all)]
pub fn process_model<F>(
    input: LoadInput,
    opts: &ProcessOptions,
    on_progress: F,
) -> MeshpressResult<ExportResult>
where
    F: FnMut(&StageProgress) + 'static,
{
    let sink = Rc::new(RefCell::new(on_progress));

    let mut exporter = Exporter::new();
    {
        let sink = sink.clone();
        exporter.on_progress(move |event| {
            (*sink.borrow_mut())(&StageProgress {
                stage: PipelineStage::Exporting,
                event: event.clone(),
            });
        });
    }

    // Fast path: a scene graph with no optimization requested exports
    // directly, skipping the optimizer entirely.
    if let LoadInput::FromScene(scene) = &input
        && !opts.optimize.any_enabled()
    {
        emit_stage(&sink, PipelineStage::Loading, "load", 100, "Using scene graph directly");
        return finish_export(&mut exporter, scene_document(scene)?, opts);
    }

    let mut optimizer = Optimizer::new();
    {
        let sink = sink.clone();
        optimizer.on_progress(move |event| {
            let stage = if event.operation == "load" {
                PipelineStage::Loading
            } else {
                PipelineStage::Optimizing
            };
            (*sink.borrow_mut())(&StageProgress {
                stage,
                event: event.clone(),
            });
        });
    }

    match input {
        LoadInput::FromPath(path) => optimizer.load_from_path(path)?,
        LoadInput::FromBuffer { name, data } => optimizer.load_from_bytes(&name, &data)?,
        LoadInput::FromScene(scene) => optimizer.load_from_scene(&scene)?,
    }

    optimizer.optimize_all(&opts.optimize)?;

    let doc = optimizer.document()?.clone();
    finish_export(&mut exporter, doc, opts)
}

fn scene_document(scene: &SceneGraph) -> MeshpressResult<Document> {
    crate::scene::scene_to_document(scene)
}

fn finish_export(
    exporter: &mut Exporter,
    mut doc: Document,
    opts: &ProcessOptions,
) -> MeshpressResult<ExportResult> {
    if let Some(modified) = &opts.export.modified_texture_resources {
        splice_modified_textures(&mut doc, modified);
    }
    match opts.export.format {
        ExportFormat::Glb => Ok(ExportResult::Glb(exporter.export_document_glb(&doc)?)),
        ExportFormat::Gltf => Ok(ExportResult::Gltf(exporter.export_document_gltf(&doc)?)),
    }
}

/// Replace texture bytes whose name matches a modified resource entry.
/// Entries are keyed by file name; the match also accepts the file stem.
fn splice_modified_textures(doc: &mut Document, modified: &BTreeMap<String, Vec<u8>>) {
    for (name, bytes) in modified {
        let stem = name
            .rsplit_once('.')
            .map(|(stem, _)| stem)
            .unwrap_or(name.as_str());
        for (index, texture) in doc.textures.iter_mut().enumerate() {
            let texture_name = texture
                .name
                .clone()
                .unwrap_or_else(|| format!("texture{index}"));
            if texture_name == *name || texture_name == stem {
                texture.image = bytes.clone();
                texture.mime_type = mime_for_name(name);
            }
        }
    }
}

fn emit_stage(
    sink: &Rc<RefCell<impl FnMut(&StageProgress)>>,
    stage: PipelineStage,
    operation: &str,
    progress: u8,
    details: &str,
) {
    (*sink.borrow_mut())(&StageProgress {
        stage,
        event: crate::foundation::progress::ProgressEvent {
            operation: operation.to_owned(),
            progress,
            details: Some(details.to_owned()),
        },
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Texture;
    use crate::scene::{SceneMaterial, SceneMesh, SceneNode, SceneTexture};

    fn demo_scene() -> SceneGraph {
        SceneGraph {
            name: Some("demo".into()),
            roots: vec![SceneNode {
                mesh: Some(SceneMesh {
                    name: Some("tri".into()),
                    positions: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
                    material: Some(SceneMaterial {
                        base_color_texture: Some(SceneTexture {
                            name: Some("albedo".into()),
                            mime_type: Some("image/png".into()),
                            image: vec![1; 16],
                        }),
                        ..SceneMaterial::default()
                    }),
                    ..SceneMesh::default()
                }),
                ..SceneNode::default()
            }],
        }
    }

    #[test]
    fn scene_fast_path_exports_without_optimizing() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let stages = Rc::new(RefCell::new(Vec::new()));
        let sink = stages.clone();
        let result = process_model(
            LoadInput::FromScene(demo_scene()),
            &ProcessOptions::default(),
            move |progress| sink.borrow_mut().push(progress.stage),
        )
        .expect("process");

        assert!(matches!(result, ExportResult::Glb(_)));
        let stages = stages.borrow();
        assert!(stages.contains(&PipelineStage::Loading));
        assert!(stages.contains(&PipelineStage::Exporting));
        assert!(!stages.contains(&PipelineStage::Optimizing));
    }

    #[test]
    fn optimizing_scene_input_round_trips_through_the_document() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let stages = Rc::new(RefCell::new(Vec::new()));
        let sink = stages.clone();
        let result = process_model(
            LoadInput::FromScene(demo_scene()),
            &ProcessOptions {
                optimize: OptimizeAllOptions {
                    deduplicate: Some(crate::optimize::DedupOptions::default()),
                    ..OptimizeAllOptions::default()
                },
                export: ExportOptions {
                    format: ExportFormat::Gltf,
                    modified_texture_resources: None,
                },
            },
            move |progress| sink.borrow_mut().push(progress.stage),
        )
        .expect("process");

        assert!(matches!(result, ExportResult::Gltf(_)));
        assert!(stages.borrow().contains(&PipelineStage::Optimizing));
    }

    #[test]
    fn modified_texture_resources_splice_by_name() {
        let mut doc = Document {
            textures: vec![Texture {
                name: Some("albedo".into()),
                mime_type: "image/png".into(),
                image: vec![0; 8],
                sampler: None,
            }],
            ..Document::default()
        };
        let mut modified = BTreeMap::new();
        modified.insert("albedo.webp".to_owned(), vec![9; 4]);
        splice_modified_textures(&mut doc, &modified);
        assert_eq!(doc.textures[0].image, vec![9; 4]);
        assert_eq!(doc.textures[0].mime_type, "image/webp");
    }
}
