//! Source archive handling.
//!
//! Archives are expected to be named `<library>-<version>.<extension>` and to
//! unpack into a single `<library>-<version>/` root. The extraction directory
//! name is computed from the file name alone; the unpacked tree is never
//! inspected to discover it.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use tar::Archive;
use tracing::{debug, info};

use crate::error::{BuildError, Result};

/// Archive container/compression combinations we know how to unpack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    TarZst,
    Tar,
}

impl ArchiveFormat {
    /// Known extensions, longest first so `.tar.gz` wins over `.tar`.
    const EXTENSIONS: &'static [(&'static str, ArchiveFormat)] = &[
        (".tar.gz", ArchiveFormat::TarGz),
        (".tar.zst", ArchiveFormat::TarZst),
        (".tgz", ArchiveFormat::TarGz),
        (".tar", ArchiveFormat::Tar),
    ];

    /// Detect the format from a file name, returning it with the stripped stem.
    pub fn detect(file_name: &str) -> Option<(ArchiveFormat, &str)> {
        Self::EXTENSIONS.iter().find_map(|(ext, format)| {
            file_name
                .strip_suffix(ext)
                .filter(|stem| !stem.is_empty())
                .map(|stem| (*format, stem))
        })
    }
}

/// Derive the top-level directory name an archive unpacks to.
///
/// `lame-3.99.5.tar.gz` becomes `lame-3.99.5`. Fails when the extension is
/// unknown or the stem lacks a `-<version>` suffix starting with a digit.
pub fn extraction_dir_name(archive: &Path) -> Result<String> {
    let file_name = archive
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| BuildError::InvalidArchiveName {
            file: archive.display().to_string(),
        })?;

    let invalid = || BuildError::InvalidArchiveName {
        file: file_name.to_string(),
    };

    let (_, stem) = ArchiveFormat::detect(file_name).ok_or_else(invalid)?;
    let (name, version) = split_name_version(stem).ok_or_else(invalid)?;
    debug!("archive {} -> library '{}' version '{}'", file_name, name, version);
    Ok(stem.to_string())
}

/// Split `<library>-<version>` at the first `-` that is followed by a digit.
fn split_name_version(stem: &str) -> Option<(&str, &str)> {
    stem.match_indices('-').find_map(|(idx, _)| {
        let (name, rest) = (&stem[..idx], &stem[idx + 1..]);
        let starts_with_digit = rest.chars().next().is_some_and(|c| c.is_ascii_digit());
        (!name.is_empty() && starts_with_digit).then_some((name, rest))
    })
}

/// Unpack `archive` into `dest`.
///
/// On failure `dest` is left in an undefined state; callers abort the run.
pub fn extract(archive: &Path, dest: &Path) -> Result<()> {
    let file_name = archive
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let (format, _) = ArchiveFormat::detect(file_name).ok_or_else(|| BuildError::Extraction {
        archive: archive.to_path_buf(),
        reason: "unknown archive extension".to_string(),
    })?;

    let failed = |reason: String| BuildError::Extraction {
        archive: archive.to_path_buf(),
        reason,
    };

    let file = File::open(archive).map_err(|e| failed(format!("cannot open: {e}")))?;
    let reader = BufReader::new(file);

    let unpacked = match format {
        ArchiveFormat::TarGz => Archive::new(GzDecoder::new(reader)).unpack(dest),
        ArchiveFormat::TarZst => {
            let decoder = zstd::stream::Decoder::new(reader)
                .map_err(|e| failed(format!("cannot initialise zstd decoder: {e}")))?;
            Archive::new(decoder).unpack(dest)
        }
        ArchiveFormat::Tar => Archive::new(reader).unpack(dest),
    };
    unpacked.map_err(|e| failed(e.to_string()))?;

    info!("EXTRACTED: {}", archive.display());
    Ok(())
}

/// Check an archive against an expected lowercase hex sha256 digest.
pub fn verify_sha256(archive: &Path, expected: &str) -> Result<()> {
    let actual = sha256_file(archive).map_err(|e| BuildError::Extraction {
        archive: archive.to_path_buf(),
        reason: format!("cannot hash: {e}"),
    })?;
    if !actual.eq_ignore_ascii_case(expected.trim()) {
        return Err(BuildError::Extraction {
            archive: archive.to_path_buf(),
            reason: format!("sha256 mismatch\n  expected: {}\n  actual:   {}", expected, actual),
        });
    }
    Ok(())
}

fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut r = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    /// Build a `.tar.gz` at `path` containing `files` (relative path, content).
    pub(crate) fn write_tar_gz(path: &Path, files: &[(&str, &str)]) {
        let out = File::create(path).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(out, Compression::default()));
        for (name, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder
                .append_data(&mut header, name, content.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn dir_name_strips_tar_gz() {
        let name = extraction_dir_name(Path::new("/src/lame-3.99.5.tar.gz")).unwrap();
        assert_eq!(name, "lame-3.99.5");
    }

    #[test]
    fn dir_name_for_any_dotted_version() {
        for (lib, a, b, c) in [("zlib", 1, 2, 13), ("x", 0, 0, 0), ("libogg-dev", 10, 200, 3000)] {
            let file = format!("{lib}-{a}.{b}.{c}.tar.gz");
            assert_eq!(
                extraction_dir_name(Path::new(&file)).unwrap(),
                format!("{lib}-{a}.{b}.{c}")
            );
        }
    }

    #[test]
    fn dir_name_other_formats() {
        assert_eq!(
            extraction_dir_name(Path::new("pthreads-w32-2.9.1.tar.zst")).unwrap(),
            "pthreads-w32-2.9.1"
        );
        assert_eq!(extraction_dir_name(Path::new("ogg-1.3.tgz")).unwrap(), "ogg-1.3");
    }

    #[test]
    fn dir_name_rejects_nonconforming_names() {
        for bad in ["lame.tar.gz", "lame-latest.tar.gz", "-1.0.tar.gz", "lame-3.99.5.zip", ".tar.gz"] {
            let err = extraction_dir_name(Path::new(bad)).unwrap_err();
            assert!(
                matches!(err, BuildError::InvalidArchiveName { .. }),
                "{bad} should be rejected, got {err:?}"
            );
        }
    }

    #[test]
    fn extract_tar_gz_populates_dest() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("demo-1.0.0.tar.gz");
        write_tar_gz(
            &archive,
            &[("demo-1.0.0/configure", "#!/bin/sh\n"), ("demo-1.0.0/include/demo.h", "int x;\n")],
        );
        let dest = temp.path().join("out");
        fs::create_dir_all(&dest).unwrap();

        extract(&archive, &dest).unwrap();

        assert!(dest.join("demo-1.0.0/configure").is_file());
        assert_eq!(
            fs::read_to_string(dest.join("demo-1.0.0/include/demo.h")).unwrap(),
            "int x;\n"
        );
    }

    #[test]
    fn extract_tar_zst() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("demo-2.0.tar.zst");
        {
            let out = File::create(&archive).unwrap();
            let encoder = zstd::stream::Encoder::new(out, 3).unwrap();
            let mut builder = tar::Builder::new(encoder);
            let mut header = tar::Header::new_gnu();
            header.set_size(2);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, "demo-2.0/README", &b"hi"[..])
                .unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }
        let dest = temp.path().join("out");
        fs::create_dir_all(&dest).unwrap();

        extract(&archive, &dest).unwrap();
        assert!(dest.join("demo-2.0/README").is_file());
    }

    #[test]
    fn extract_truncated_archive_fails() {
        let temp = TempDir::new().unwrap();
        let good = temp.path().join("good-1.0.tar.gz");
        let big = "x".repeat(64 * 1024);
        write_tar_gz(&good, &[("good-1.0/a", &big), ("good-1.0/b", &big)]);
        let bytes = fs::read(&good).unwrap();
        let truncated = temp.path().join("bad-1.0.tar.gz");
        fs::write(&truncated, &bytes[..bytes.len() / 2]).unwrap();

        let err = extract(&truncated, temp.path()).unwrap_err();
        assert!(matches!(err, BuildError::Extraction { .. }));
    }

    #[test]
    fn extract_missing_archive_fails() {
        let temp = TempDir::new().unwrap();
        let err = extract(&PathBuf::from("/nonexistent/x-1.0.tar.gz"), temp.path()).unwrap_err();
        assert!(matches!(err, BuildError::Extraction { .. }));
    }

    #[test]
    fn verify_sha256_detects_mismatch() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("a-1.0.tar");
        fs::write(&file, "abc").unwrap();

        verify_sha256(
            &file,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
        )
        .unwrap();
        let err = verify_sha256(&file, "00").unwrap_err();
        assert!(err.to_string().contains("sha256 mismatch"));
    }
}
