use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use reqwest::blocking::Client;
use reqwest::header::USER_AGENT;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tar::Archive;
use tracing::{debug, info};
use url::Url;
use xz2::read::XzDecoder;
use zip::ZipArchive;

use super::{pin_matches_digest, tree_digest, url_key, Fetched};

const DEFAULT_USER_AGENT: &str = concat!("devshell/", env!("CARGO_PKG_VERSION"));

/// Archive container formats recognized by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchiveFormat {
    TarGz,
    TarXz,
    Tar,
    Zip,
}

impl ArchiveFormat {
    pub fn from_name(name: &str) -> Option<Self> {
        let lowered = name.to_ascii_lowercase();
        if lowered.ends_with(".tar.gz") || lowered.ends_with(".tgz") {
            Some(ArchiveFormat::TarGz)
        } else if lowered.ends_with(".tar.xz") || lowered.ends_with(".txz") {
            Some(ArchiveFormat::TarXz)
        } else if lowered.ends_with(".tar") {
            Some(ArchiveFormat::Tar)
        } else if lowered.ends_with(".zip") {
            Some(ArchiveFormat::Zip)
        } else {
            None
        }
    }

    fn extension(self) -> &'static str {
        match self {
            ArchiveFormat::TarGz => "tar.gz",
            ArchiveFormat::TarXz => "tar.xz",
            ArchiveFormat::Tar => "tar",
            ArchiveFormat::Zip => "zip",
        }
    }
}

/// Download (or read) an archive, unpack it and content-address the result.
///
/// The pinned revision, when present, must match the unpacked tree digest.
pub(super) fn fetch(
    cache_dir: &Path,
    url: &Url,
    format: ArchiveFormat,
    pinned: Option<&str>,
    timeout: Duration,
) -> Result<Fetched> {
    let downloads = cache_dir.join("downloads");
    let archive_path = downloads.join(format!("{}.{}", url_key(url), format.extension()));

    match url.scheme() {
        "file" => {
            let source = url
                .to_file_path()
                .map_err(|_| anyhow::anyhow!("invalid file url {url}"))?;
            if !source.is_file() {
                bail!("archive {:?} does not exist", source);
            }
            fs::create_dir_all(&downloads)
                .with_context(|| format!("failed to create download directory {:?}", downloads))?;
            fs::copy(&source, &archive_path)
                .with_context(|| format!("failed to copy archive {:?}", source))?;
        }
        // Previously downloaded archives are reused only when the content is pinned.
        _ if pinned.is_some() && archive_path.exists() => {
            debug!(%url, "reusing downloaded archive");
        }
        _ => {
            let checksum = download(url, &archive_path, timeout)?;
            debug!(%url, sha256 = %hex::encode(checksum), "downloaded archive");
        }
    }

    let staging = cache_dir
        .join("snapshots")
        .join(format!("{}.partial", url_key(url)));
    if staging.exists() {
        fs::remove_dir_all(&staging)
            .with_context(|| format!("failed to clear stale unpack directory {:?}", staging))?;
    }
    fs::create_dir_all(&staging)
        .with_context(|| format!("failed to create unpack directory {:?}", staging))?;

    extract_archive(&archive_path, format, &staging)?;
    let unpacked = single_top_level_dir(&staging)?.unwrap_or_else(|| staging.clone());

    let digest = tree_digest(&unpacked)?;
    if let Some(pin) = pinned {
        if !pin_matches_digest(pin, &digest) {
            fs::remove_dir_all(&staging).ok();
            bail!("revision '{pin}' does not match content digest {digest}");
        }
    }

    let hex = digest.trim_start_matches("sha256-");
    let root = cache_dir
        .join("snapshots")
        .join(format!("archive-{}", &hex[..32]));
    if root.exists() {
        fs::remove_dir_all(&staging).ok();
    } else {
        fs::rename(&unpacked, &root)
            .with_context(|| format!("failed to move unpacked archive into {:?}", root))?;
        fs::remove_dir_all(&staging).ok();
    }

    Ok(Fetched {
        revision: digest.clone(),
        digest,
        root,
    })
}

fn download(url: &Url, dest: &Path, timeout: Duration) -> Result<[u8; 32]> {
    info!(%url, "downloading archive input");
    let client = Client::builder()
        .timeout(timeout)
        .build()
        .context("failed to build http client")?;

    let mut response = client
        .get(url.as_str())
        .header(USER_AGENT, DEFAULT_USER_AGENT)
        .send()
        .with_context(|| format!("failed to download {url}"))?;

    if !response.status().is_success() {
        bail!("download of {url} returned {}", response.status());
    }

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create download directory {:?}", parent))?;
    }

    let temp_path = dest.with_extension("download");
    let mut file = File::create(&temp_path)
        .with_context(|| format!("failed to create temporary file {:?}", temp_path))?;

    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let read = response
            .read(&mut buffer)
            .with_context(|| format!("failed while reading {url}"))?;
        if read == 0 {
            break;
        }
        file.write_all(&buffer[..read])
            .with_context(|| format!("failed while writing {:?}", temp_path))?;
        hasher.update(&buffer[..read]);
    }

    file.flush()
        .with_context(|| format!("failed to flush {:?}", temp_path))?;

    fs::rename(&temp_path, dest)
        .with_context(|| format!("failed to move {:?} to {:?}", temp_path, dest))?;

    Ok(hasher.finalize().into())
}

fn extract_archive(archive_path: &Path, format: ArchiveFormat, dest: &Path) -> Result<()> {
    let file = File::open(archive_path)
        .with_context(|| format!("failed to open archive {:?}", archive_path))?;

    match format {
        ArchiveFormat::TarGz => Archive::new(GzDecoder::new(file))
            .unpack(dest)
            .with_context(|| format!("failed to unpack tar.gz archive {:?}", archive_path)),
        ArchiveFormat::TarXz => Archive::new(XzDecoder::new(file))
            .unpack(dest)
            .with_context(|| format!("failed to unpack tar.xz archive {:?}", archive_path)),
        ArchiveFormat::Tar => Archive::new(file)
            .unpack(dest)
            .with_context(|| format!("failed to unpack tar archive {:?}", archive_path)),
        ArchiveFormat::Zip => extract_zip(file, archive_path, dest),
    }
}

fn extract_zip(file: File, archive_path: &Path, dest: &Path) -> Result<()> {
    let mut archive = ZipArchive::new(file)
        .with_context(|| format!("failed to read zip archive {:?}", archive_path))?;

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .with_context(|| format!("failed to read zip entry #{index} from {:?}", archive_path))?;

        let Some(enclosed) = entry.enclosed_name().map(|path| dest.join(path)) else {
            continue;
        };

        if entry.name().ends_with('/') {
            fs::create_dir_all(&enclosed)
                .with_context(|| format!("failed to create directory {:?}", enclosed))?;
            continue;
        }

        if let Some(parent) = enclosed.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {:?}", parent))?;
        }

        let mut outfile = File::create(&enclosed)
            .with_context(|| format!("failed to create file {:?}", enclosed))?;
        io::copy(&mut entry, &mut outfile)
            .with_context(|| format!("failed to extract zip entry {:?}", enclosed))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                fs::set_permissions(&enclosed, fs::Permissions::from_mode(mode))
                    .with_context(|| format!("failed to set permissions on {:?}", enclosed))?;
            }
        }
    }

    Ok(())
}

/// Archives usually wrap their contents in one directory; treat it as the root.
fn single_top_level_dir(dir: &Path) -> Result<Option<PathBuf>> {
    let mut entries = fs::read_dir(dir)
        .with_context(|| format!("failed to read {:?}", dir))?
        .collect::<io::Result<Vec<_>>>()
        .with_context(|| format!("failed to read {:?}", dir))?;

    if entries.len() != 1 {
        return Ok(None);
    }

    let entry = entries.remove(0);
    if entry.file_type()?.is_dir() {
        Ok(Some(entry.path()))
    } else {
        Ok(None)
    }
}
