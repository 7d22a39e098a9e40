use meshpress::{
    DedupOptions, Document, MeshpressError, NormalsOptions, OptimizeAllOptions, Optimizer,
    QuantizeOptions, SimplifyOptions, write_binary,
};

/// A document with weldable vertices, duplicate materials and duplicate
/// textures, so every transform has something to chew on.
fn redundant_document() -> Document {
    use meshpress::scene::{SceneGraph, SceneMaterial, SceneMesh, SceneNode, SceneTexture};

    // Build through the scene boundary so the fixture stays readable.
    let mesh = SceneMesh {
        name: Some("patch".into()),
        positions: vec![
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [1.0, 0.0, 0.0], // duplicate of vertex 1
            [1.0, 1.0, 0.0],
            [0.0, 1.0, 0.0], // duplicate of vertex 2
        ],
        indices: vec![0, 1, 2, 3, 4, 5],
        material: Some(SceneMaterial {
            base_color_texture: Some(SceneTexture {
                name: Some("checker".into()),
                mime_type: Some("image/png".into()),
                image: vec![42; 256],
            }),
            ..SceneMaterial::default()
        }),
        ..SceneMesh::default()
    };

    let scene = SceneGraph {
        name: None,
        roots: vec![
            SceneNode {
                name: Some("a".into()),
                mesh: Some(mesh.clone()),
                ..SceneNode::default()
            },
            SceneNode {
                name: Some("b".into()),
                mesh: Some(mesh),
                ..SceneNode::default()
            },
        ],
    };

    let mut optimizer = Optimizer::new();
    optimizer.load_from_scene(&scene).expect("load scene");
    optimizer.document().expect("doc").clone()
}

fn loaded_optimizer() -> (Optimizer, u64) {
    let doc = redundant_document();
    let bytes = write_binary(&doc).expect("serialize fixture");
    let size = bytes.len() as u64;
    let mut optimizer = Optimizer::new();
    optimizer.load_from_bytes("fixture.glb", &bytes).expect("load");
    (optimizer, size)
}

fn current_size(optimizer: &Optimizer) -> u64 {
    write_binary(optimizer.document().expect("doc")).expect("serialize").len() as u64
}

#[test]
fn size_never_increases_across_a_transform_sequence() {
    let (mut optimizer, original) = loaded_optimizer();
    let mut previous = current_size(&optimizer);

    optimizer
        .simplify(&SimplifyOptions {
            ratio: 0.5,
            error: 0.001,
        })
        .expect("simplify");
    let after_simplify = current_size(&optimizer);
    assert!(after_simplify <= previous);
    previous = after_simplify;

    optimizer
        .deduplicate(&DedupOptions::default())
        .expect("dedup");
    let after_dedup = current_size(&optimizer);
    assert!(after_dedup <= previous);
    previous = after_dedup;

    optimizer
        .quantize(&QuantizeOptions::default())
        .expect("quantize");
    let after_quantize = current_size(&optimizer);
    assert!(after_quantize <= previous);
    previous = after_quantize;

    optimizer
        .optimize_normals(&NormalsOptions { overwrite: true })
        .expect("normals");
    let after_normals = current_size(&optimizer);
    assert!(after_normals <= previous);

    let report = optimizer.report().expect("report");
    assert_eq!(report.original_size, original);
    assert!(report.optimized_size <= original);
}

#[test]
fn load_then_simplify_scenario() {
    let (mut optimizer, s0) = loaded_optimizer();
    let counts_before = optimizer.document().unwrap().stats();

    optimizer
        .simplify(&SimplifyOptions {
            ratio: 0.5,
            error: 0.001,
        })
        .expect("simplify");

    let s1 = current_size(&optimizer);
    assert!(s1 <= s0, "committed simplify grew the document: {s1} > {s0}");

    let report = optimizer.report().expect("report");
    if report.applied_optimizations.contains(&"simplify".to_owned()) {
        assert!(report.stats.after.triangles <= counts_before.triangles);
    } else {
        // Reverted: the document must be untouched.
        assert_eq!(optimizer.document().unwrap().stats(), counts_before);
    }
}

#[test]
fn report_baseline_is_pinned_at_load_time() {
    let (mut optimizer, original) = loaded_optimizer();
    assert_eq!(optimizer.report().unwrap().original_size, original);

    optimizer
        .optimize_all(&OptimizeAllOptions {
            simplify: Some(SimplifyOptions::default()),
            deduplicate: Some(DedupOptions::default()),
            quantize: Some(QuantizeOptions::default()),
            ..OptimizeAllOptions::default()
        })
        .expect("optimize all");

    let report = optimizer.report().expect("report");
    assert_eq!(report.original_size, original);
    assert_eq!(report.stats.before.vertices, 12);
    assert!(report.compression_ratio <= 1.0);
}

#[test]
fn dedup_merges_the_duplicate_mesh_and_texture() {
    let (mut optimizer, _) = loaded_optimizer();
    let before = optimizer.document().unwrap().stats();
    assert_eq!(before.meshes, 2);

    optimizer
        .deduplicate(&DedupOptions::default())
        .expect("dedup");

    let report = optimizer.report().expect("report");
    if report.applied_optimizations.contains(&"deduplicate".to_owned()) {
        let after = optimizer.document().unwrap().stats();
        assert_eq!(after.meshes, 1);
        assert_eq!(after.textures, 1);
        assert_eq!(after.materials, 1);
    }
}

#[test]
fn every_operation_requires_a_loaded_document() {
    let mut optimizer = Optimizer::new();
    let failures = [
        matches!(
            optimizer.simplify(&SimplifyOptions::default()),
            Err(MeshpressError::IllegalState(_))
        ),
        matches!(
            optimizer.deduplicate(&DedupOptions::default()),
            Err(MeshpressError::IllegalState(_))
        ),
        matches!(
            optimizer.quantize(&QuantizeOptions::default()),
            Err(MeshpressError::IllegalState(_))
        ),
        matches!(
            optimizer.optimize_normals(&NormalsOptions::default()),
            Err(MeshpressError::IllegalState(_))
        ),
        matches!(
            optimizer.optimize_all(&OptimizeAllOptions::default()),
            Err(MeshpressError::IllegalState(_))
        ),
        matches!(optimizer.report(), Err(MeshpressError::IllegalState(_))),
    ];
    assert!(failures.iter().all(|&failed| failed));
}
