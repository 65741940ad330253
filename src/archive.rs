//! Dataset archive extraction.

use crate::{ForgeError, Result};
use flate2::read::GzDecoder;
use std::fs::File;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    TarGz,
}

impl ArchiveKind {
    /// Infer the archive kind from a file name.
    pub fn from_name(name: &str) -> Option<ArchiveKind> {
        let lower = name.to_lowercase();
        if lower.ends_with(".zip") {
            Some(ArchiveKind::Zip)
        } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(ArchiveKind::TarGz)
        } else {
            None
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveKind::Zip => "zip",
            ArchiveKind::TarGz => "tar.gz",
        }
    }
}

/// Unpack `archive_path` into `dest_dir`. The kind is inferred from the file
/// name; anything unrecognized is a layout failure, not an I/O one.
pub fn extract_archive(archive_path: &Path, dest_dir: &Path) -> Result<()> {
    let name = archive_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let kind = ArchiveKind::from_name(name).ok_or_else(|| ForgeError::BadDatasetLayout {
        detail: format!("unsupported archive format: {name}"),
    })?;
    std::fs::create_dir_all(dest_dir)?;
    match kind {
        ArchiveKind::Zip => {
            let file = File::open(archive_path)?;
            let mut archive = zip::ZipArchive::new(file)?;
            archive.extract(dest_dir)?;
        }
        ArchiveKind::TarGz => {
            let file = File::open(archive_path)?;
            let decoder = GzDecoder::new(file);
            let mut archive = tar::Archive::new(decoder);
            // A decode failure here means a corrupt archive, not flaky I/O.
            archive
                .unpack(dest_dir)
                .map_err(|e| ForgeError::BadDatasetLayout {
                    detail: format!("tar extraction failed: {e}"),
                })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn kind_is_inferred_from_name() {
        assert_eq!(ArchiveKind::from_name("data.zip"), Some(ArchiveKind::Zip));
        assert_eq!(
            ArchiveKind::from_name("data.tar.gz"),
            Some(ArchiveKind::TarGz)
        );
        assert_eq!(ArchiveKind::from_name("data.tgz"), Some(ArchiveKind::TarGz));
        assert_eq!(ArchiveKind::from_name("data.rar"), None);
        assert_eq!(ArchiveKind::from_name("data"), None);
    }

    #[test]
    fn zip_round_trip_extracts_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let archive_path = dir.path().join("dataset.zip");

        let file = File::create(&archive_path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        writer.start_file("train/rose/a.jpg", options).unwrap();
        writer.write_all(b"fake-jpeg").unwrap();
        writer.start_file("train/tulip/b.jpg", options).unwrap();
        writer.write_all(b"fake-jpeg-2").unwrap();
        writer.finish().unwrap();

        let out = dir.path().join("out");
        extract_archive(&archive_path, &out).unwrap();
        assert!(out.join("train/rose/a.jpg").exists());
        assert!(out.join("train/tulip/b.jpg").exists());
    }

    #[test]
    fn tar_gz_round_trip_extracts_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let archive_path = dir.path().join("dataset.tar.gz");

        let file = File::create(&archive_path).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let payload = b"fake-jpeg";
        let mut header = tar::Header::new_gnu();
        header.set_size(payload.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "val/rose/c.jpg", payload.as_slice())
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let out = dir.path().join("out");
        extract_archive(&archive_path, &out).unwrap();
        assert!(out.join("val/rose/c.jpg").exists());
    }

    #[test]
    fn unknown_format_is_a_layout_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("dataset.rar");
        std::fs::write(&path, b"whatever").unwrap();
        let err = extract_archive(&path, &dir.path().join("out")).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::BadDatasetLayout);
    }
}
