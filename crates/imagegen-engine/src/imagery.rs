use std::fs;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

const PNG_SIGNATURE: &[u8; 8] = b"\x89PNG\r\n\x1a\n";

// SOF0..SOF15 minus the standalone/DHP markers (C4, C8, CC).
const JPEG_SOF_MARKERS: [u8; 13] = [
    0xC0, 0xC1, 0xC2, 0xC3, 0xC5, 0xC6, 0xC7, 0xC9, 0xCA, 0xCB, 0xCD, 0xCE, 0xCF,
];

/// Recover pixel dimensions from raw image bytes by header sniffing alone.
/// Total on arbitrary input: malformed or truncated data yields None.
pub fn sniff_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    png_dimensions(data)
        .or_else(|| jpeg_dimensions(data))
        .or_else(|| gif_dimensions(data))
        .or_else(|| bmp_dimensions(data))
}

fn png_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    if data.len() < 24 || &data[..8] != PNG_SIGNATURE {
        return None;
    }
    let width = u32::from_be_bytes(data[16..20].try_into().ok()?);
    let height = u32::from_be_bytes(data[20..24].try_into().ok()?);
    Some((width, height))
}

fn jpeg_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    if data.len() < 4 || data[0] != 0xFF || data[1] != 0xD8 {
        return None;
    }
    let mut i = 2usize;
    while i + 9 < data.len() {
        if data[i] != 0xFF {
            i += 1;
            continue;
        }
        // Skip fill bytes; a 0xFF run at the buffer tail sniffs as no match.
        while i < data.len() && data[i] == 0xFF {
            i += 1;
        }
        if i >= data.len() {
            return None;
        }
        let marker = data[i];
        i += 1;
        if marker == 0xD8 || marker == 0xD9 {
            continue;
        }
        if marker == 0xDA {
            // Start of scan before any frame header.
            return None;
        }
        if i + 2 > data.len() {
            return None;
        }
        let segment_length = u16::from_be_bytes([data[i], data[i + 1]]) as usize;
        if segment_length < 2 || i + segment_length > data.len() {
            return None;
        }
        if JPEG_SOF_MARKERS.contains(&marker) {
            if i + 7 > data.len() {
                return None;
            }
            let height = u16::from_be_bytes([data[i + 3], data[i + 4]]) as u32;
            let width = u16::from_be_bytes([data[i + 5], data[i + 6]]) as u32;
            return Some((width, height));
        }
        i += segment_length;
    }
    None
}

fn gif_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    if data.len() < 10 || (&data[..6] != b"GIF87a" && &data[..6] != b"GIF89a") {
        return None;
    }
    let width = u16::from_le_bytes([data[6], data[7]]) as u32;
    let height = u16::from_le_bytes([data[8], data[9]]) as u32;
    Some((width, height))
}

fn bmp_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    if data.len() < 26 || &data[..2] != b"BM" {
        return None;
    }
    let width = i32::from_le_bytes(data[18..22].try_into().ok()?);
    // Negative height encodes top-down row order.
    let height = i32::from_le_bytes(data[22..26].try_into().ok()?);
    if width <= 0 || height == 0 {
        return None;
    }
    Some((width as u32, height.unsigned_abs()))
}

/// Strict base64: any character outside the standard alphabet (or bad
/// padding) yields None instead of a best-effort decode.
pub fn safe_b64_decode(value: &str) -> Option<Vec<u8>> {
    BASE64.decode(value).ok()
}

/// Resolve an arbitrary image reference to bytes: data-URI first, then an
/// existing local file, then raw base64. Never errors; unresolvable input
/// is None. URLs are out of scope here (see the auto-crop loader).
pub fn load_image_bytes(value: &str) -> Option<Vec<u8>> {
    if value.is_empty() {
        return None;
    }
    if value.starts_with("data:image/") {
        let (_, payload) = value.split_once(',')?;
        return safe_b64_decode(payload);
    }
    let path = Path::new(value);
    if path.is_file() {
        return fs::read(path).ok();
    }
    safe_b64_decode(value)
}

pub fn infer_image_size(value: &str) -> Option<String> {
    let bytes = load_image_bytes(value)?;
    let (width, height) = sniff_dimensions(&bytes)?;
    Some(format!("{width}x{height}"))
}

pub fn is_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputImageKind {
    Url,
    DataUri,
    Base64,
}

#[derive(Debug, Clone)]
pub struct InputImage {
    pub kind: InputImageKind,
    pub value: String,
}

/// Classify an input-image reference the way providers consume it. Local
/// files are inlined to a data-URI; unknown strings are treated as raw
/// base64 for flexibility.
pub fn parse_input_image(value: Option<&str>) -> Option<InputImage> {
    let value = value?;
    if value.is_empty() {
        return None;
    }
    if is_url(value) {
        return Some(InputImage {
            kind: InputImageKind::Url,
            value: value.to_string(),
        });
    }
    if value.starts_with("data:image/") {
        return Some(InputImage {
            kind: InputImageKind::DataUri,
            value: value.to_string(),
        });
    }
    let path = Path::new(value);
    if path.is_file() {
        let bytes = fs::read(path).ok()?;
        let mime = mime_for_path(path);
        return Some(InputImage {
            kind: InputImageKind::DataUri,
            value: format!("data:{mime};base64,{}", BASE64.encode(bytes)),
        });
    }
    Some(InputImage {
        kind: InputImageKind::Base64,
        value: value.to_string(),
    })
}

pub fn mime_for_path(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("bmp") => "image/bmp",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}

pub fn encode_data_uri(mime: &str, bytes: &[u8]) -> String {
    format!("data:{mime};base64,{}", BASE64.encode(bytes))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;

    use super::{
        encode_data_uri, infer_image_size, load_image_bytes, parse_input_image, safe_b64_decode,
        sniff_dimensions, InputImageKind,
    };

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let mut data = b"\x89PNG\r\n\x1a\n".to_vec();
        data.extend_from_slice(&[0u8; 8]); // IHDR length + type
        data.extend_from_slice(&width.to_be_bytes());
        data.extend_from_slice(&height.to_be_bytes());
        data
    }

    fn jpeg_bytes(width: u16, height: u16) -> Vec<u8> {
        let mut data = vec![0xFF, 0xD8];
        // APP0 segment the scanner must skip over.
        data.extend_from_slice(&[0xFF, 0xE0, 0x00, 0x04, 0x00, 0x00]);
        // SOF0: length 17, precision, height, width.
        data.extend_from_slice(&[0xFF, 0xC0, 0x00, 0x11, 0x08]);
        data.extend_from_slice(&height.to_be_bytes());
        data.extend_from_slice(&width.to_be_bytes());
        data.extend_from_slice(&[0u8; 12]);
        data
    }

    #[test]
    fn png_dimensions_recovered() {
        assert_eq!(sniff_dimensions(&png_bytes(1024, 768)), Some((1024, 768)));
    }

    #[test]
    fn jpeg_dimensions_recovered_from_sof_segment() {
        assert_eq!(sniff_dimensions(&jpeg_bytes(768, 512)), Some((768, 512)));
    }

    #[test]
    fn jpeg_scan_before_frame_is_no_match() {
        let data = vec![0xFF, 0xD8, 0xFF, 0xDA, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        assert_eq!(sniff_dimensions(&data), None);
    }

    #[test]
    fn jpeg_truncated_segment_is_no_match() {
        let data = vec![0xFF, 0xD8, 0xFF, 0xC0, 0x00, 0x11, 0x08, 0x00, 0x01, 0x00, 0x01];
        assert_eq!(sniff_dimensions(&data), None);
    }

    #[test]
    fn jpeg_trailing_fill_bytes_are_no_match() {
        let data = vec![0xFF, 0xD8, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];
        assert_eq!(sniff_dimensions(&data), None);
    }

    #[test]
    fn gif_dimensions_recovered() {
        let mut data = b"GIF89a".to_vec();
        data.extend_from_slice(&320u16.to_le_bytes());
        data.extend_from_slice(&240u16.to_le_bytes());
        assert_eq!(sniff_dimensions(&data), Some((320, 240)));
    }

    #[test]
    fn bmp_dimensions_use_absolute_height() {
        let mut data = b"BM".to_vec();
        data.extend_from_slice(&[0u8; 16]);
        data.extend_from_slice(&640i32.to_le_bytes());
        data.extend_from_slice(&(-480i32).to_le_bytes());
        assert_eq!(sniff_dimensions(&data), Some((640, 480)));

        let mut zero_height = b"BM".to_vec();
        zero_height.extend_from_slice(&[0u8; 16]);
        zero_height.extend_from_slice(&640i32.to_le_bytes());
        zero_height.extend_from_slice(&0i32.to_le_bytes());
        assert_eq!(sniff_dimensions(&zero_height), None);
    }

    #[test]
    fn random_bytes_are_no_match() {
        assert_eq!(sniff_dimensions(&[0x12, 0x34, 0x56, 0x78]), None);
        assert_eq!(sniff_dimensions(&[]), None);
        let junk: Vec<u8> = (0..64).map(|i| (i * 37 % 251) as u8).collect();
        assert_eq!(sniff_dimensions(&junk), None);
    }

    #[test]
    fn data_uri_round_trip_preserves_bytes() {
        let bytes = png_bytes(12, 34);
        let uri = encode_data_uri("image/png", &bytes);
        assert_eq!(load_image_bytes(&uri), Some(bytes));
    }

    #[test]
    fn strict_base64_rejects_foreign_characters() {
        assert!(safe_b64_decode("aGVsbG8=").is_some());
        assert!(safe_b64_decode("aGVs bG8=").is_none());
        assert!(safe_b64_decode("not base64!").is_none());
    }

    #[test]
    fn malformed_data_uri_yields_no_bytes() {
        assert_eq!(load_image_bytes("data:image/png;base64"), None);
        assert_eq!(load_image_bytes("data:image/png;base64,???"), None);
    }

    #[test]
    fn infer_size_from_raw_base64() {
        let encoded = BASE64.encode(png_bytes(800, 600));
        assert_eq!(infer_image_size(&encoded), Some("800x600".to_string()));
        assert_eq!(infer_image_size("definitely not an image"), None);
    }

    #[test]
    fn infer_size_from_local_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("probe.png");
        fs::write(&path, png_bytes(256, 128))?;
        assert_eq!(
            infer_image_size(path.to_str().unwrap()),
            Some("256x128".to_string())
        );
        Ok(())
    }

    #[test]
    fn parse_input_image_classifies_references() -> anyhow::Result<()> {
        let url = parse_input_image(Some("https://cdn.example.com/a.png")).unwrap();
        assert_eq!(url.kind, InputImageKind::Url);

        let data_uri = parse_input_image(Some("data:image/png;base64,aGVsbG8=")).unwrap();
        assert_eq!(data_uri.kind, InputImageKind::DataUri);

        let raw = parse_input_image(Some("aGVsbG8=")).unwrap();
        assert_eq!(raw.kind, InputImageKind::Base64);
        assert_eq!(raw.value, "aGVsbG8=");

        assert!(parse_input_image(None).is_none());
        assert!(parse_input_image(Some("")).is_none());

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("source.png");
        fs::write(&path, b"fake image bytes")?;
        let local = parse_input_image(path.to_str()).unwrap();
        assert_eq!(local.kind, InputImageKind::DataUri);
        assert!(local.value.starts_with("data:image/png;base64,"));
        Ok(())
    }
}
