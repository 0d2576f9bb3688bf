//! Media format detection from magic bytes.
//!
//! Used to validate decode output and to confirm captures whose content type
//! alone is not conclusive.

use crate::media::ResourceType;

/// Number of leading bytes needed to recognize every supported format.
pub const SIGNATURE_LEN: usize = 189;

/// A recognized standard media container or codec stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaFormat {
    Jpeg,
    Png,
    Gif,
    Webp,
    Bmp,
    Mp4,
    M4a,
    Mov,
    Webm,
    Flv,
    MpegTs,
    Aac,
    Mp3,
    Ogg,
    Flac,
    Wav,
}

impl MediaFormat {
    /// Returns the canonical mime type.
    pub fn mime(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Gif => "image/gif",
            Self::Webp => "image/webp",
            Self::Bmp => "image/bmp",
            Self::Mp4 => "video/mp4",
            Self::M4a => "audio/mp4",
            Self::Mov => "video/quicktime",
            Self::Webm => "video/webm",
            Self::Flv => "video/x-flv",
            Self::MpegTs => "video/mp2t",
            Self::Aac => "audio/aac",
            Self::Mp3 => "audio/mpeg",
            Self::Ogg => "audio/ogg",
            Self::Flac => "audio/flac",
            Self::Wav => "audio/wav",
        }
    }

    /// Returns the file extension, without the dot.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::Gif => "gif",
            Self::Webp => "webp",
            Self::Bmp => "bmp",
            Self::Mp4 => "mp4",
            Self::M4a => "m4a",
            Self::Mov => "mov",
            Self::Webm => "webm",
            Self::Flv => "flv",
            Self::MpegTs => "ts",
            Self::Aac => "aac",
            Self::Mp3 => "mp3",
            Self::Ogg => "ogg",
            Self::Flac => "flac",
            Self::Wav => "wav",
        }
    }

    /// Returns the resource type this format belongs to.
    pub fn resource_type(&self) -> ResourceType {
        match self {
            Self::Jpeg | Self::Png | Self::Gif | Self::Webp | Self::Bmp => ResourceType::Image,
            Self::Mp4 | Self::Mov | Self::Webm | Self::Flv | Self::MpegTs => ResourceType::Video,
            Self::M4a | Self::Aac | Self::Mp3 | Self::Ogg | Self::Flac | Self::Wav => {
                ResourceType::Audio
            }
        }
    }
}

/// Detects a media format from the leading bytes of a file or stream.
///
/// Pass at least [`SIGNATURE_LEN`] bytes when available; MPEG-TS needs two
/// packet sync bytes to be told apart from text.
pub fn detect_format(data: &[u8]) -> Option<MediaFormat> {
    if data.len() < 4 {
        return None;
    }

    if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some(MediaFormat::Jpeg);
    }
    if data.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
        return Some(MediaFormat::Png);
    }
    if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        return Some(MediaFormat::Gif);
    }
    if data.len() >= 12 && data.starts_with(b"RIFF") {
        return match &data[8..12] {
            b"WEBP" => Some(MediaFormat::Webp),
            b"WAVE" => Some(MediaFormat::Wav),
            _ => None,
        };
    }
    if data.len() >= 12 && &data[4..8] == b"ftyp" {
        return Some(match &data[8..12] {
            b"M4A " | b"M4B " => MediaFormat::M4a,
            b"qt  " => MediaFormat::Mov,
            _ => MediaFormat::Mp4,
        });
    }
    if data.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        return Some(MediaFormat::Webm);
    }
    if data.starts_with(b"FLV\x01") {
        return Some(MediaFormat::Flv);
    }
    if data.starts_with(b"OggS") {
        return Some(MediaFormat::Ogg);
    }
    if data.starts_with(b"fLaC") {
        return Some(MediaFormat::Flac);
    }
    if data.starts_with(b"ID3") {
        return Some(MediaFormat::Mp3);
    }
    if data[0] == 0x47 && data.len() >= SIGNATURE_LEN && data[188] == 0x47 {
        return Some(MediaFormat::MpegTs);
    }
    if data[0] == 0xFF && (data[1] & 0xF6) == 0xF0 {
        return Some(MediaFormat::Aac);
    }
    if data[0] == 0xFF && (data[1] & 0xE0) == 0xE0 {
        return Some(MediaFormat::Mp3);
    }
    if data.len() >= 14 && data.starts_with(b"BM") {
        return Some(MediaFormat::Bmp);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_images() {
        assert_eq!(
            detect_format(&[0xFF, 0xD8, 0xFF, 0xE0, 0, 0]),
            Some(MediaFormat::Jpeg)
        );
        assert_eq!(
            detect_format(b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR"),
            Some(MediaFormat::Png)
        );
        assert_eq!(detect_format(b"GIF89a\x01\0"), Some(MediaFormat::Gif));
        assert_eq!(detect_format(b"RIFF\0\0\0\0WEBPVP8 "), Some(MediaFormat::Webp));
    }

    #[test]
    fn detects_video_containers() {
        assert_eq!(
            detect_format(b"\0\0\0\x20ftypisom\0\0\x02\0"),
            Some(MediaFormat::Mp4)
        );
        assert_eq!(detect_format(b"\0\0\0\x14ftypqt  "), Some(MediaFormat::Mov));
        assert_eq!(
            detect_format(&[0x1A, 0x45, 0xDF, 0xA3, 0x9F]),
            Some(MediaFormat::Webm)
        );
        assert_eq!(detect_format(b"FLV\x01\x05"), Some(MediaFormat::Flv));

        let mut ts = vec![0u8; 376];
        ts[0] = 0x47;
        ts[188] = 0x47;
        assert_eq!(detect_format(&ts), Some(MediaFormat::MpegTs));
    }

    #[test]
    fn detects_audio() {
        assert_eq!(detect_format(b"ID3\x04\0\0"), Some(MediaFormat::Mp3));
        assert_eq!(detect_format(&[0xFF, 0xFB, 0x90, 0x64]), Some(MediaFormat::Mp3));
        assert_eq!(detect_format(&[0xFF, 0xF1, 0x50, 0x80]), Some(MediaFormat::Aac));
        assert_eq!(detect_format(b"\0\0\0\x20ftypM4A "), Some(MediaFormat::M4a));
        assert_eq!(detect_format(b"OggS\0\x02"), Some(MediaFormat::Ogg));
        assert_eq!(detect_format(b"fLaC\0\0"), Some(MediaFormat::Flac));
        assert_eq!(detect_format(b"RIFF\0\0\0\0WAVEfmt "), Some(MediaFormat::Wav));
    }

    #[test]
    fn rejects_text_and_short_input() {
        assert_eq!(detect_format(b"<html>"), None);
        assert_eq!(detect_format(b"{\"a\":1}"), None);
        assert_eq!(detect_format(&[0xFF, 0xD8]), None);
        // A lone 'G' is not a transport stream.
        assert_eq!(detect_format(b"GET / HTTP/1.1"), None);
    }

    #[test]
    fn format_maps_to_type() {
        assert_eq!(MediaFormat::Png.resource_type(), ResourceType::Image);
        assert_eq!(MediaFormat::MpegTs.resource_type(), ResourceType::Video);
        assert_eq!(MediaFormat::Flac.resource_type(), ResourceType::Audio);
        assert_eq!(MediaFormat::Mp4.extension(), "mp4");
        assert_eq!(MediaFormat::Jpeg.mime(), "image/jpeg");
    }
}
