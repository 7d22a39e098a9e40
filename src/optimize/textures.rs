//! Texture recompression: local encoders plus the remote offload path.

use std::io::Cursor;

use serde::{Deserialize, Serialize};

use crate::document::Document;
use crate::foundation::error::{MeshpressError, MeshpressResult};
use crate::offload::{OffloadConfig, OffloadRequest, TextureOffloadClient};
use crate::optimize::dedup;

/// Target image format for texture recompression.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextureTarget {
    #[default]
    WebP,
    Jpeg,
    Png,
}

impl TextureTarget {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WebP => "webp",
            Self::Jpeg => "jpeg",
            Self::Png => "png",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Self::WebP => "image/webp",
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
        }
    }
}

/// Where texture recompression runs.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextureBackend {
    /// Encode in-process with the `image` crate.
    #[default]
    Local,
    /// Delegate each texture to a remote worker.
    Remote(OffloadConfig),
}

/// Options for the texture-compression transform.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TextureCompressionOptions {
    pub format: TextureTarget,
    /// Encoder quality in `0..=100`. Applies to JPEG locally; forwarded
    /// verbatim to remote workers for every format.
    pub quality: u8,
    /// Optional `[width, height]` downscale applied before encoding.
    pub resize: Option<[u32; 2]>,
    pub backend: TextureBackend,
}

impl Default for TextureCompressionOptions {
    fn default() -> Self {
        Self {
            format: TextureTarget::WebP,
            quality: 80,
            resize: None,
            backend: TextureBackend::Local,
        }
    }
}

/// Outcome summary for a texture-compression run.
#[derive(Debug)]
pub(crate) struct TextureRunOutcome {
    pub succeeded: usize,
    pub failed: Vec<(usize, String)>,
    pub used_fallback: bool,
}

pub(crate) fn compress_textures(
    doc: &mut Document,
    opts: &TextureCompressionOptions,
) -> MeshpressResult<TextureRunOutcome> {
    if opts.quality > 100 {
        return Err(MeshpressError::validation(
            "texture quality must be in 0..=100",
        ));
    }
    if let Some([width, height]) = opts.resize
        && (width == 0 || height == 0)
    {
        return Err(MeshpressError::validation(
            "texture resize dimensions must be non-zero",
        ));
    }

    if doc.textures.is_empty() {
        return Ok(TextureRunOutcome {
            succeeded: 0,
            failed: Vec::new(),
            used_fallback: false,
        });
    }

    match &opts.backend {
        TextureBackend::Local => compress_local(doc, opts),
        TextureBackend::Remote(config) => compress_remote(doc, opts, config),
    }
}

fn compress_local(
    doc: &mut Document,
    opts: &TextureCompressionOptions,
) -> MeshpressResult<TextureRunOutcome> {
    let mut succeeded = 0usize;
    let mut failed = Vec::new();

    for index in 0..doc.textures.len() {
        match encode_one(&doc.textures[index].image, opts) {
            Ok(encoded) => {
                let texture = &mut doc.textures[index];
                texture.image = encoded;
                texture.mime_type = opts.format.mime_type().to_owned();
                succeeded += 1;
            }
            Err(error) => failed.push((index, error.to_string())),
        }
    }

    if succeeded == 0 {
        // Encoder path is unavailable for every texture; fall back to
        // structural cleanup before giving up entirely.
        dedup::dedup_textures(doc);
        dedup::prune_unused_textures(doc);
        return Ok(TextureRunOutcome {
            succeeded: 0,
            failed,
            used_fallback: true,
        });
    }

    Ok(TextureRunOutcome {
        succeeded,
        failed,
        used_fallback: false,
    })
}

fn compress_remote(
    doc: &mut Document,
    opts: &TextureCompressionOptions,
    config: &OffloadConfig,
) -> MeshpressResult<TextureRunOutcome> {
    let payloads = doc.texture_payloads();
    let client = TextureOffloadClient::new(config.clone())?;
    let request = OffloadRequest {
        format: opts.format,
        quality: opts.quality,
        resize: opts.resize,
    };

    let batch = client.recompress_all(&payloads, &request)?;
    let mut succeeded = 0usize;
    for result in batch.results {
        // recompress_all already verified index identity per response.
        if let Some(texture) = doc.textures.get_mut(result.index) {
            texture.image = result.data;
            texture.mime_type = result.mime_type;
            succeeded += 1;
        }
    }
    Ok(TextureRunOutcome {
        succeeded,
        failed: batch
            .failures
            .into_iter()
            .map(|f| (f.index, f.reason))
            .collect(),
        used_fallback: false,
    })
}

fn encode_one(bytes: &[u8], opts: &TextureCompressionOptions) -> MeshpressResult<Vec<u8>> {
    let decoded = image::load_from_memory(bytes)
        .map_err(|e| MeshpressError::transform(format!("failed to decode texture: {e}")))?;

    let resized = match opts.resize {
        Some([width, height]) => {
            decoded.resize_exact(width, height, image::imageops::FilterType::Triangle)
        }
        None => decoded,
    };

    let mut out = Vec::new();
    match opts.format {
        TextureTarget::Png => {
            resized
                .write_to(&mut Cursor::new(&mut out), image::ImageFormat::Png)
                .map_err(|e| MeshpressError::transform(format!("PNG encode failed: {e}")))?;
        }
        TextureTarget::Jpeg => {
            let mut cursor = Cursor::new(&mut out);
            let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(
                &mut cursor,
                opts.quality.clamp(1, 100),
            );
            // JPEG has no alpha channel.
            image::DynamicImage::ImageRgb8(resized.to_rgb8())
                .write_with_encoder(encoder)
                .map_err(|e| MeshpressError::transform(format!("JPEG encode failed: {e}")))?;
        }
        TextureTarget::WebP => {
            let mut cursor = Cursor::new(&mut out);
            let encoder = image::codecs::webp::WebPEncoder::new_lossless(&mut cursor);
            image::DynamicImage::ImageRgba8(resized.to_rgba8())
                .write_with_encoder(encoder)
                .map_err(|e| MeshpressError::transform(format!("WebP encode failed: {e}")))?;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Texture;

    fn png_texture(pixel: [u8; 4]) -> Texture {
        let img = image::RgbaImage::from_pixel(4, 4, image::Rgba(pixel));
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .expect("encode fixture");
        Texture {
            name: Some("fixture".into()),
            mime_type: "image/png".into(),
            image: bytes,
            sampler: None,
        }
    }

    #[test]
    fn local_jpeg_compression_replaces_bytes_and_mime() {
        let mut doc = Document {
            textures: vec![png_texture([200, 10, 10, 255])],
            ..Document::default()
        };
        let outcome = compress_textures(
            &mut doc,
            &TextureCompressionOptions {
                format: TextureTarget::Jpeg,
                ..TextureCompressionOptions::default()
            },
        )
        .expect("compress");
        assert_eq!(outcome.succeeded, 1);
        assert!(outcome.failed.is_empty());
        assert_eq!(doc.textures[0].mime_type, "image/jpeg");
        assert!(image::load_from_memory(&doc.textures[0].image).is_ok());
    }

    #[test]
    fn resize_shrinks_output_dimensions() {
        let mut doc = Document {
            textures: vec![png_texture([0, 0, 255, 255])],
            ..Document::default()
        };
        compress_textures(
            &mut doc,
            &TextureCompressionOptions {
                format: TextureTarget::Png,
                resize: Some([2, 2]),
                ..TextureCompressionOptions::default()
            },
        )
        .expect("compress");
        let img = image::load_from_memory(&doc.textures[0].image).expect("decode");
        assert_eq!(img.width(), 2);
        assert_eq!(img.height(), 2);
    }

    #[test]
    fn undecodable_textures_trigger_the_basic_fallback() {
        let mut doc = Document {
            textures: vec![
                Texture {
                    name: Some("junk-a".into()),
                    mime_type: "image/png".into(),
                    image: vec![0xde, 0xad],
                    sampler: None,
                },
                Texture {
                    name: Some("junk-b".into()),
                    mime_type: "image/png".into(),
                    image: vec![0xde, 0xad],
                    sampler: None,
                },
            ],
            ..Document::default()
        };
        let outcome = compress_textures(&mut doc, &TextureCompressionOptions::default())
            .expect("fallback path");
        assert_eq!(outcome.succeeded, 0);
        assert!(outcome.used_fallback);
        assert_eq!(outcome.failed.len(), 2);
        // Fallback deduped the identical bytes, then pruned the orphan.
        assert!(doc.textures.is_empty());
    }

    #[test]
    fn invalid_quality_is_rejected() {
        let mut doc = Document::default();
        let err = compress_textures(
            &mut doc,
            &TextureCompressionOptions {
                quality: 101,
                ..TextureCompressionOptions::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, MeshpressError::Validation(_)));
    }
}
