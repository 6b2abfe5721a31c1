//! Image fetch and transformation pipeline
//!
//! Pulls product images from supplier CDNs, verifies the payload really is an
//! image by signature (never by URL extension or Content-Type), scales it to
//! the catalog's display bounds and re-encodes it. Every failure here is
//! per-image: a product with one broken image still syncs with the rest.

pub mod host;

use crate::error::ImageError;
use crate::models::StagedImage;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::ImageFormat;
use sha2::{Digest, Sha256};
use std::io::Cursor;
use std::time::Duration;

/// Hard cap on a single downloaded image
const MAX_DOWNLOAD_BYTES: usize = 10 * 1024 * 1024;
/// Display bounds of the remote catalog; images are fitted inside, never
/// upscaled
const MAX_WIDTH: u32 = 800;
const MAX_HEIGHT: u32 = 600;
const JPEG_QUALITY: u8 = 85;

/// Fetches and transforms one image at a time.
pub struct ImagePipeline {
    client: reqwest::Client,
}

impl ImagePipeline {
    pub fn new(timeout: Duration) -> Result<Self, ImageError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ImageError::Unreachable(format!("http client: {}", e)))?;
        Ok(Self { client })
    }

    /// Download, verify, scale and re-encode one image for one product.
    pub async fn stage(&self, sku: &str, url: &str) -> Result<StagedImage, ImageError> {
        let raw = self.fetch(url).await?;
        let (bytes, format) = transform(&raw)?;

        let checksum = format!("{:x}", Sha256::digest(&bytes));
        let filename = format!("{}_{}.{}", sku, &checksum[..12], format);

        Ok(StagedImage {
            source_url: url.to_string(),
            bytes,
            format,
            filename,
            checksum,
        })
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, ImageError> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| classify_fetch_error(url, &e))?;
        if !response.status().is_success() {
            return Err(ImageError::Unreachable(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }

        // Stream so an oversized body is cut off mid-download
        let mut bytes = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| classify_fetch_error(url, &e))?
        {
            if bytes.len() + chunk.len() > MAX_DOWNLOAD_BYTES {
                return Err(ImageError::TooLarge(bytes.len() + chunk.len()));
            }
            bytes.extend_from_slice(&chunk);
        }
        Ok(bytes)
    }
}

fn classify_fetch_error(url: &str, e: &reqwest::Error) -> ImageError {
    if e.is_timeout() {
        ImageError::Timeout(url.to_string())
    } else {
        ImageError::Unreachable(format!("{}: {}", url, e))
    }
}

/// Identify the payload by magic bytes. Anything that is not JPEG, PNG or
/// WebP is rejected; suppliers have been known to serve PDFs from .jpg URLs.
fn sniff_format(bytes: &[u8]) -> Result<ImageFormat, ImageError> {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Ok(ImageFormat::Jpeg)
    } else if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        Ok(ImageFormat::Png)
    } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Ok(ImageFormat::WebP)
    } else {
        let prefix: Vec<u8> = bytes.iter().take(8).copied().collect();
        Err(ImageError::UnsupportedFormat(format!(
            "signature {:02x?}",
            prefix
        )))
    }
}

/// Decode, fit inside the display bounds and re-encode.
///
/// PNG sources stay PNG so transparency survives; everything else comes out
/// as quality-controlled JPEG.
pub fn transform(raw: &[u8]) -> Result<(Vec<u8>, &'static str), ImageError> {
    let format = sniff_format(raw)?;
    let decoded = image::load_from_memory_with_format(raw, format)
        .map_err(|e| ImageError::Decode(e.to_string()))?;

    let scaled = if decoded.width() > MAX_WIDTH || decoded.height() > MAX_HEIGHT {
        decoded.resize(MAX_WIDTH, MAX_HEIGHT, FilterType::Lanczos3)
    } else {
        decoded
    };

    let mut out = Vec::new();
    if format == ImageFormat::Png {
        scaled
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .map_err(|e| ImageError::Decode(e.to_string()))?;
        Ok((out, "png"))
    } else {
        let encoder = JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
        scaled
            .to_rgb8()
            .write_with_encoder(encoder)
            .map_err(|e| ImageError::Decode(e.to_string()))?;
        Ok((out, "jpeg"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, RgbImage, RgbaImage};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgba8(RgbaImage::new(width, height));
        let mut out = Vec::new();
        img.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .unwrap();
        out
    }

    fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::new(width, height));
        let mut out = Vec::new();
        img.write_to(&mut Cursor::new(&mut out), ImageFormat::Jpeg)
            .unwrap();
        out
    }

    #[test]
    fn sniff_accepts_real_image_signatures() {
        assert!(sniff_format(&jpeg_bytes(4, 4)).is_ok());
        assert!(sniff_format(&png_bytes(4, 4)).is_ok());

        let mut webp = b"RIFF".to_vec();
        webp.extend_from_slice(&[0, 0, 0, 0]);
        webp.extend_from_slice(b"WEBP");
        assert_eq!(sniff_format(&webp).unwrap(), ImageFormat::WebP);
    }

    #[test]
    fn sniff_rejects_disguised_payloads() {
        // PDF served from a .jpg URL
        assert!(matches!(
            sniff_format(b"%PDF-1.7 ..."),
            Err(ImageError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            sniff_format(b"GIF89a...."),
            Err(ImageError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            sniff_format(b""),
            Err(ImageError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn oversized_images_are_fitted_inside_bounds() {
        let (bytes, format) = transform(&jpeg_bytes(1600, 1200)).unwrap();
        assert_eq!(format, "jpeg");

        let out = image::load_from_memory(&bytes).unwrap();
        assert!(out.width() <= MAX_WIDTH);
        assert!(out.height() <= MAX_HEIGHT);
        // Aspect ratio 4:3 preserved
        assert_eq!(out.width(), 800);
        assert_eq!(out.height(), 600);
    }

    #[test]
    fn small_images_are_never_upscaled() {
        let (bytes, _) = transform(&jpeg_bytes(100, 80)).unwrap();
        let out = image::load_from_memory(&bytes).unwrap();
        assert_eq!((out.width(), out.height()), (100, 80));
    }

    #[test]
    fn png_stays_png_for_transparency() {
        let (bytes, format) = transform(&png_bytes(64, 64)).unwrap();
        assert_eq!(format, "png");
        assert!(bytes.starts_with(&[0x89, b'P', b'N', b'G']));
    }

    #[test]
    fn truncated_jpeg_is_a_decode_error() {
        // Valid signature, garbage body
        let raw = [0xFF, 0xD8, 0xFF, 0x00, 0x01, 0x02];
        assert!(matches!(transform(&raw), Err(ImageError::Decode(_))));
    }

    #[tokio::test]
    async fn stage_produces_a_named_checksummed_image() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/p100.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(jpeg_bytes(32, 32)))
            .mount(&server)
            .await;

        let pipeline = ImagePipeline::new(Duration::from_secs(5)).unwrap();
        let url = format!("{}/p100.jpg", server.uri());
        let staged = pipeline.stage("MKTO_2040", &url).await.unwrap();

        assert_eq!(staged.source_url, url);
        assert_eq!(staged.format, "jpeg");
        assert!(staged.filename.starts_with("MKTO_2040_"));
        assert!(staged.filename.ends_with(".jpeg"));
        assert_eq!(staged.checksum, format!("{:x}", Sha256::digest(&staged.bytes)));
    }

    #[tokio::test]
    async fn missing_images_are_unreachable_not_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let pipeline = ImagePipeline::new(Duration::from_secs(5)).unwrap();
        let err = pipeline
            .stage("MKTO_1", &format!("{}/gone.jpg", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, ImageError::Unreachable(_)));
    }

    #[tokio::test]
    async fn oversized_downloads_are_cut_off() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200).set_body_bytes(vec![0u8; MAX_DOWNLOAD_BYTES + 1]),
            )
            .mount(&server)
            .await;

        let pipeline = ImagePipeline::new(Duration::from_secs(5)).unwrap();
        let err = pipeline
            .stage("MKTO_1", &format!("{}/huge.jpg", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, ImageError::TooLarge(_)));
    }
}
