use meshpress::{Exporter, Optimizer, SceneTransferPayload};
use meshpress::scene::{SceneGraph, SceneMaterial, SceneMesh, SceneNode, SceneTexture};

fn textured_scene() -> SceneGraph {
    SceneGraph {
        name: Some("transfer".into()),
        roots: vec![SceneNode {
            mesh: Some(SceneMesh {
                name: Some("tri".into()),
                positions: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
                material: Some(SceneMaterial {
                    base_color_texture: Some(SceneTexture {
                        // Unnamed, so the exporter derives `texture0.webp`.
                        name: None,
                        mime_type: Some("image/webp".into()),
                        image: vec![0x52, 0x49, 0x46, 0x46, 0xAA, 0xBB, 0xCC, 0xDD],
                    }),
                    ..SceneMaterial::default()
                }),
                ..SceneMesh::default()
            }),
            ..SceneNode::default()
        }],
    }
}

/// Export the scene so the payload carries `buffer0.bin` and
/// `texture0.webp`.
fn webp_payload() -> SceneTransferPayload {
    let mut optimizer = Optimizer::new();
    optimizer.load_from_scene(&textured_scene()).expect("load");
    let doc = optimizer.document().expect("doc").clone();

    let mut exporter = Exporter::new();
    let export = exporter.export_document_gltf(&doc).expect("gltf");
    SceneTransferPayload::from_gltf_export(&export)
}

fn tempdir(tag: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "meshpress_{tag}_{}_{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

#[test]
fn payload_reconstructs_in_memory_with_matching_counts() {
    let payload = webp_payload();

    let referenced = payload.referenced_asset_names();
    assert!(referenced.contains(&"buffer0.bin".to_owned()));
    assert!(referenced.contains(&"texture0.webp".to_owned()));
    assert_eq!(referenced.len(), payload.asset_data.len());

    let doc = payload.to_document().expect("reconstruct");
    let stats = doc.stats();
    assert_eq!(stats.textures, 1);
    assert_eq!(stats.meshes, 1);
    assert_eq!(stats.vertices, 3);
    assert_eq!(doc.textures[0].mime_type, "image/webp");
}

#[test]
fn payload_reconstructs_through_files_and_the_codec() {
    let payload = webp_payload();
    let dir = tempdir("transfer");

    let json_path = payload.write_to_dir(&dir, "scene").expect("write");
    assert!(json_path.ends_with("scene.gltf"));
    assert!(dir.join("buffer0.bin").exists());
    assert!(dir.join("texture0.webp").exists());

    let mut optimizer = Optimizer::new();
    optimizer.load_from_path(&json_path).expect("reload");
    let stats = optimizer.document().expect("doc").stats();
    assert_eq!(stats.textures, 1);
    assert_eq!(stats.vertices, 3);

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn payload_survives_json_serialization() {
    let payload = webp_payload();
    let wire = serde_json::to_string(&payload).expect("serialize");
    assert!(wire.contains("\"gltfJson\""));
    assert!(wire.contains("\"assetData\""));
    assert!(wire.contains("\"encoding\":\"base64\""));

    let parsed: SceneTransferPayload = serde_json::from_str(&wire).expect("parse");
    assert_eq!(parsed, payload);
    let doc = parsed.to_document().expect("reconstruct");
    assert_eq!(doc.stats().textures, 1);
}

#[test]
fn viewer_settings_ride_along_untouched() {
    let mut payload = webp_payload();
    payload.camera = Some(serde_json::json!({"position": [0, 1, 5], "fov": 45}));
    payload.controls = Some(serde_json::json!({"autoRotate": true}));

    let wire = serde_json::to_value(&payload).expect("serialize");
    assert_eq!(wire["camera"]["fov"], 45);
    assert_eq!(wire["controls"]["autoRotate"], true);

    let parsed: SceneTransferPayload =
        serde_json::from_value(wire).expect("parse");
    assert_eq!(parsed.camera, payload.camera);
}
