//! Content-hash deduplication of document resources.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::Xxh3;

use crate::document::{Document, Mesh, Primitive};
use crate::foundation::error::MeshpressResult;

/// Options for the deduplicate transform. Every flag defaults to `true`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct DedupOptions {
    pub textures: bool,
    pub materials: bool,
    pub meshes: bool,
    pub accessors: bool,
}

impl Default for DedupOptions {
    fn default() -> Self {
        Self {
            textures: true,
            materials: true,
            meshes: true,
            accessors: true,
        }
    }
}

pub(crate) fn deduplicate(doc: &mut Document, opts: &DedupOptions) -> MeshpressResult<()> {
    if opts.accessors {
        // Identical attribute streams collapse into one buffer view at
        // serialization time.
        doc.shared_accessors = true;
    }
    if opts.textures {
        dedup_textures(doc);
        prune_unused_textures(doc);
    }
    if opts.materials {
        dedup_materials(doc);
        prune_unused_materials(doc);
    }
    if opts.meshes {
        dedup_meshes(doc);
        prune_unused_meshes(doc);
    }
    Ok(())
}

/// Merge textures with identical bytes and MIME type, remapping material
/// references onto the first occurrence.
pub(crate) fn dedup_textures(doc: &mut Document) {
    let mut first_by_hash: HashMap<u64, usize> = HashMap::new();
    let mut remap: Vec<usize> = (0..doc.textures.len()).collect();
    for (index, texture) in doc.textures.iter().enumerate() {
        let mut hasher = Xxh3::new();
        hasher.update(texture.mime_type.as_bytes());
        hasher.update(&texture.image);
        let hash = hasher.digest();
        match first_by_hash.get(&hash) {
            Some(&first) if doc.textures[first].image == texture.image => remap[index] = first,
            Some(_) => {}
            None => {
                first_by_hash.insert(hash, index);
            }
        }
    }
    remap_texture_refs(doc, &remap);
}

/// Drop textures referenced by no material, compacting indices.
pub(crate) fn prune_unused_textures(doc: &mut Document) {
    let mut used = vec![false; doc.textures.len()];
    for material in &doc.materials {
        for reference in material.texture_refs() {
            if let Some(slot) = used.get_mut(reference) {
                *slot = true;
            }
        }
    }
    if used.iter().all(|&u| u) {
        return;
    }

    let mut remap = vec![usize::MAX; doc.textures.len()];
    let mut kept = Vec::new();
    for (index, texture) in doc.textures.drain(..).enumerate() {
        if used[index] {
            remap[index] = kept.len();
            kept.push(texture);
        }
    }
    doc.textures = kept;
    remap_texture_refs(doc, &remap);
}

fn remap_texture_refs(doc: &mut Document, remap: &[usize]) {
    for material in &mut doc.materials {
        for slot in material.texture_refs_mut() {
            if let Some(reference) = *slot {
                *slot = remap.get(reference).copied().filter(|&r| r != usize::MAX);
            }
        }
    }
}

fn dedup_materials(doc: &mut Document) {
    let mut first_by_key: HashMap<String, usize> = HashMap::new();
    let mut remap: Vec<usize> = (0..doc.materials.len()).collect();
    for (index, material) in doc.materials.iter().enumerate() {
        // Names are presentation-only; two materials differing only by name
        // still merge.
        let mut keyed = material.clone();
        keyed.name = None;
        let key = serde_json::to_string(&keyed).unwrap_or_default();
        match first_by_key.get(&key) {
            Some(&first) => remap[index] = first,
            None => {
                first_by_key.insert(key, index);
            }
        }
    }
    for mesh in &mut doc.meshes {
        for primitive in &mut mesh.primitives {
            if let Some(material) = primitive.material {
                primitive.material = remap.get(material).copied();
            }
        }
    }
}

fn prune_unused_materials(doc: &mut Document) {
    let mut used = vec![false; doc.materials.len()];
    for mesh in &doc.meshes {
        for primitive in &mesh.primitives {
            if let Some(material) = primitive.material
                && let Some(slot) = used.get_mut(material)
            {
                *slot = true;
            }
        }
    }
    if used.iter().all(|&u| u) {
        return;
    }

    let mut remap = vec![usize::MAX; doc.materials.len()];
    let mut kept = Vec::new();
    for (index, material) in doc.materials.drain(..).enumerate() {
        if used[index] {
            remap[index] = kept.len();
            kept.push(material);
        }
    }
    doc.materials = kept;
    for mesh in &mut doc.meshes {
        for primitive in &mut mesh.primitives {
            if let Some(material) = primitive.material {
                primitive.material = remap.get(material).copied().filter(|&r| r != usize::MAX);
            }
        }
    }
}

fn dedup_meshes(doc: &mut Document) {
    let mut first_by_hash: HashMap<u64, usize> = HashMap::new();
    let mut remap: Vec<usize> = (0..doc.meshes.len()).collect();
    for (index, mesh) in doc.meshes.iter().enumerate() {
        let hash = hash_mesh(mesh);
        match first_by_hash.get(&hash) {
            Some(&first) => remap[index] = first,
            None => {
                first_by_hash.insert(hash, index);
            }
        }
    }
    for node in &mut doc.nodes {
        if let Some(mesh) = node.mesh {
            node.mesh = remap.get(mesh).copied();
        }
    }
}

fn prune_unused_meshes(doc: &mut Document) {
    let mut used = vec![false; doc.meshes.len()];
    for node in &doc.nodes {
        if let Some(mesh) = node.mesh
            && let Some(slot) = used.get_mut(mesh)
        {
            *slot = true;
        }
    }
    // A document with no nodes keeps its meshes; there is nothing to prune
    // against.
    if doc.nodes.is_empty() || used.iter().all(|&u| u) {
        return;
    }

    let mut remap = vec![usize::MAX; doc.meshes.len()];
    let mut kept = Vec::new();
    for (index, mesh) in doc.meshes.drain(..).enumerate() {
        if used[index] {
            remap[index] = kept.len();
            kept.push(mesh);
        }
    }
    doc.meshes = kept;
    for node in &mut doc.nodes {
        if let Some(mesh) = node.mesh {
            node.mesh = remap.get(mesh).copied().filter(|&r| r != usize::MAX);
        }
    }
}

fn hash_mesh(mesh: &Mesh) -> u64 {
    let mut hasher = Xxh3::new();
    for primitive in &mesh.primitives {
        hash_primitive(&mut hasher, primitive);
    }
    hasher.digest()
}

fn hash_primitive(hasher: &mut Xxh3, primitive: &Primitive) {
    for position in &primitive.positions {
        for component in position {
            hasher.update(&component.to_le_bytes());
        }
    }
    if let Some(normals) = &primitive.normals {
        for normal in normals {
            for component in normal {
                hasher.update(&component.to_le_bytes());
            }
        }
    }
    if let Some(tex_coords) = &primitive.tex_coords {
        for tex_coord in tex_coords {
            for component in tex_coord {
                hasher.update(&component.to_le_bytes());
            }
        }
    }
    if let Some(colors) = &primitive.colors {
        for color in colors {
            for component in color {
                hasher.update(&component.to_le_bytes());
            }
        }
    }
    for index in &primitive.indices {
        hasher.update(&index.to_le_bytes());
    }
    hasher.update(&primitive.material.map(|m| m as u64 + 1).unwrap_or(0).to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Material, Node, Texture};

    fn doc_with_duplicate_textures() -> Document {
        Document {
            textures: vec![
                Texture {
                    name: Some("a".into()),
                    mime_type: "image/png".into(),
                    image: vec![1, 2, 3],
                    sampler: None,
                },
                Texture {
                    name: Some("b".into()),
                    mime_type: "image/png".into(),
                    image: vec![1, 2, 3],
                    sampler: None,
                },
            ],
            materials: vec![
                Material {
                    base_color_texture: Some(0),
                    ..Material::default()
                },
                Material {
                    base_color_texture: Some(1),
                    ..Material::default()
                },
            ],
            ..Document::default()
        }
    }

    #[test]
    fn duplicate_textures_merge_and_prune() {
        let mut doc = doc_with_duplicate_textures();
        // Give each material a user so material dedup keeps both.
        doc.meshes = vec![
            Mesh {
                name: None,
                primitives: vec![Primitive {
                    material: Some(0),
                    ..Primitive::default()
                }],
            },
            Mesh {
                name: None,
                primitives: vec![Primitive {
                    material: Some(1),
                    ..Primitive::default()
                }],
            },
        ];
        doc.nodes = vec![
            Node {
                mesh: Some(0),
                ..Node::default()
            },
            Node {
                mesh: Some(1),
                ..Node::default()
            },
        ];

        deduplicate(&mut doc, &DedupOptions::default()).expect("dedup");
        assert_eq!(doc.textures.len(), 1);
        assert_eq!(doc.materials[0].base_color_texture, Some(0));
        // Identical materials also merged.
        assert_eq!(doc.materials.len(), 1);
        assert!(doc.shared_accessors);
    }

    #[test]
    fn identical_meshes_merge_when_enabled() {
        let primitive = Primitive {
            positions: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
            indices: vec![0, 1, 2],
            ..Primitive::default()
        };
        let mut doc = Document {
            meshes: vec![
                Mesh {
                    name: Some("a".into()),
                    primitives: vec![primitive.clone()],
                },
                Mesh {
                    name: Some("b".into()),
                    primitives: vec![primitive],
                },
            ],
            nodes: vec![
                Node {
                    mesh: Some(0),
                    ..Node::default()
                },
                Node {
                    mesh: Some(1),
                    ..Node::default()
                },
            ],
            ..Document::default()
        };

        deduplicate(
            &mut doc,
            &DedupOptions {
                textures: false,
                materials: false,
                meshes: true,
                accessors: false,
            },
        )
        .expect("dedup");
        assert_eq!(doc.meshes.len(), 1);
        assert_eq!(doc.nodes[1].mesh, Some(0));
    }

    #[test]
    fn orphan_materials_are_pruned() {
        let mut doc = Document {
            materials: vec![Material::default(), Material {
                metallic_factor: 0.25,
                ..Material::default()
            }],
            meshes: vec![Mesh {
                name: None,
                primitives: vec![Primitive {
                    material: Some(1),
                    ..Primitive::default()
                }],
            }],
            ..Document::default()
        };
        deduplicate(
            &mut doc,
            &DedupOptions {
                textures: false,
                materials: true,
                meshes: false,
                accessors: false,
            },
        )
        .expect("dedup");
        assert_eq!(doc.materials.len(), 1);
        assert_eq!(doc.meshes[0].primitives[0].material, Some(0));
    }
}
