//! Design-file recognition and lightweight header metadata.
//!
//! Full format parsing lives outside the engine; [`HeaderSniffer`] only reads
//! the first bytes of a file for the fields the well-known headers expose.
//! Extraction never fails a stage or commit: problems become
//! [`FileMetadata::Unavailable`].

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Extensions accepted by the staging area (lowercase, without dot).
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "ai", "psd", "psb", "sketch", "fig", "xd", "afdesign", "afphoto", "blend", "c4d", "max", "mb",
    "ma", "fbx", "obj",
];

/// Layered formats eligible for format-aware deltas.
pub const LAYERED_EXTENSIONS: &[&str] = &["psd", "psb", "ai", "afdesign", "afphoto"];

const HEADER_BYTES: u64 = 64;

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// True if the extension is a supported design format.
pub fn is_design_file(path: &Path) -> bool {
    extension_of(path).is_some_and(|e| SUPPORTED_EXTENSIONS.contains(&e.as_str()))
}

/// True if the extension is a layered format.
pub fn is_layered(path: &Path) -> bool {
    extension_of(path).is_some_and(|e| LAYERED_EXTENSIONS.contains(&e.as_str()))
}

/// Application family, derived from the extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesignKind {
    /// Adobe Illustrator
    Illustrator,
    /// Adobe Photoshop
    Photoshop,
    /// Sketch
    Sketch,
    /// Figma
    Figma,
    /// Adobe XD
    AdobeXd,
    /// Affinity Designer
    AffinityDesigner,
    /// Affinity Photo
    AffinityPhoto,
    /// Blender
    Blender,
    /// Cinema 4D
    Cinema4d,
    /// 3ds Max
    Max3ds,
    /// Maya (binary or ASCII)
    Maya,
    /// Autodesk FBX
    Fbx,
    /// Wavefront OBJ
    Wavefront,
}

impl DesignKind {
    /// Map a file extension to a kind.
    pub fn from_path(path: &Path) -> Option<Self> {
        let kind = match extension_of(path)?.as_str() {
            "ai" => DesignKind::Illustrator,
            "psd" | "psb" => DesignKind::Photoshop,
            "sketch" => DesignKind::Sketch,
            "fig" => DesignKind::Figma,
            "xd" => DesignKind::AdobeXd,
            "afdesign" => DesignKind::AffinityDesigner,
            "afphoto" => DesignKind::AffinityPhoto,
            "blend" => DesignKind::Blender,
            "c4d" => DesignKind::Cinema4d,
            "max" => DesignKind::Max3ds,
            "mb" | "ma" => DesignKind::Maya,
            "fbx" => DesignKind::Fbx,
            "obj" => DesignKind::Wavefront,
            _ => return None,
        };
        Some(kind)
    }
}

/// Pixel dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

/// Image color mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorMode {
    /// Single channel
    Grayscale,
    /// Red, green, blue
    Rgb,
    /// Print separations
    Cmyk,
    /// Anything the sniffer does not name
    Other,
}

/// Metadata known for a recognized design file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesignMetadata {
    /// Format family
    pub kind: DesignKind,
    /// Canvas size, when the header carries it
    pub dimensions: Option<Dimensions>,
    /// Color mode, when the header carries it
    pub color_mode: Option<ColorMode>,
    /// Number of layers, when known
    pub layer_count: Option<u32>,
    /// Format or application version string
    pub format_version: Option<String>,
}

impl DesignMetadata {
    fn bare(kind: DesignKind) -> Self {
        Self {
            kind,
            dimensions: None,
            color_mode: None,
            layer_count: None,
            format_version: None,
        }
    }
}

/// Per-file metadata recorded at stage and commit time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FileMetadata {
    /// Extraction succeeded
    Design(DesignMetadata),
    /// Extraction failed; the record keeps size and mtime only
    Unavailable {
        /// Why extraction failed
        reason: String,
    },
}

impl FileMetadata {
    /// Short human description used by `log` and `status`.
    pub fn describe(&self) -> String {
        match self {
            FileMetadata::Design(m) => {
                let mut parts = vec![format!("{:?}", m.kind)];
                if let Some(d) = m.dimensions {
                    parts.push(format!("{}x{}", d.width, d.height));
                }
                if let Some(c) = m.color_mode {
                    parts.push(format!("{:?}", c));
                }
                if let Some(l) = m.layer_count {
                    parts.push(format!("{} layers", l));
                }
                if let Some(v) = &m.format_version {
                    parts.push(v.clone());
                }
                parts.join(", ")
            }
            FileMetadata::Unavailable { reason } => format!("metadata unavailable ({})", reason),
        }
    }
}

/// Source of per-file metadata.
pub trait MetadataExtractor: Send + Sync {
    /// Extract metadata; never fails, degrading to `Unavailable`.
    fn extract(&self, path: &Path) -> FileMetadata;
}

/// Default extractor reading only the leading header bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderSniffer;

impl MetadataExtractor for HeaderSniffer {
    fn extract(&self, path: &Path) -> FileMetadata {
        let Some(kind) = DesignKind::from_path(path) else {
            return FileMetadata::Unavailable {
                reason: "unrecognized extension".to_string(),
            };
        };
        let mut header = Vec::with_capacity(HEADER_BYTES as usize);
        let read = File::open(path).and_then(|f| f.take(HEADER_BYTES).read_to_end(&mut header));
        if let Err(e) = read {
            return FileMetadata::Unavailable {
                reason: e.to_string(),
            };
        }
        sniff(kind, &header)
    }
}

fn be_u16(b: &[u8], at: usize) -> Option<u16> {
    b.get(at..at + 2).map(|s| u16::from_be_bytes([s[0], s[1]]))
}

fn be_u32(b: &[u8], at: usize) -> Option<u32> {
    b.get(at..at + 4)
        .map(|s| u32::from_be_bytes([s[0], s[1], s[2], s[3]]))
}

fn sniff(kind: DesignKind, header: &[u8]) -> FileMetadata {
    let mut meta = DesignMetadata::bare(kind);
    match kind {
        DesignKind::Photoshop => {
            if !header.starts_with(b"8BPS") {
                return FileMetadata::Unavailable {
                    reason: "missing 8BPS signature".to_string(),
                };
            }
            meta.format_version = be_u16(header, 4).map(|v| {
                if v == 2 {
                    "PSB".to_string()
                } else {
                    format!("PSD v{}", v)
                }
            });
            if let (Some(height), Some(width)) = (be_u32(header, 14), be_u32(header, 18)) {
                meta.dimensions = Some(Dimensions { width, height });
            }
            meta.color_mode = be_u16(header, 24).map(|m| match m {
                1 => ColorMode::Grayscale,
                3 => ColorMode::Rgb,
                4 => ColorMode::Cmyk,
                _ => ColorMode::Other,
            });
        }
        DesignKind::Illustrator => {
            if let Some(rest) = header.strip_prefix(b"%PDF-") {
                let version: String = rest
                    .iter()
                    .take_while(|b| b.is_ascii_digit() || **b == b'.')
                    .map(|b| *b as char)
                    .collect();
                meta.format_version = Some(format!("PDF {}", version));
            } else if header.starts_with(b"%!PS-Adobe") {
                meta.format_version = Some("PostScript".to_string());
            }
        }
        DesignKind::Blender => {
            if header.len() >= 12 && header.starts_with(b"BLENDER") {
                let v = &header[9..12];
                if v.iter().all(u8::is_ascii_digit) {
                    meta.format_version =
                        Some(format!("{}.{}{}", v[0] as char, v[1] as char, v[2] as char));
                }
            }
        }
        DesignKind::Fbx => {
            if header.starts_with(b"Kaydara FBX Binary") {
                meta.format_version = header
                    .get(23..27)
                    .map(|s| u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
                    .map(|v| format!("FBX {}", v));
            }
        }
        DesignKind::Figma => {
            if header.starts_with(b"fig-kiwi") {
                meta.format_version = Some("kiwi".to_string());
            }
        }
        _ => {}
    }
    FileMetadata::Design(meta)
}
