// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Deterministic tar+gzip archives built from filtered directory trees.

use std::{
    fs,
    io::{self, Read, Write},
    os::unix::fs::{MetadataExt as _, OpenOptionsExt as _, PermissionsExt as _},
    path::{Component, Path},
};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use tar::{Builder, EntryType, Header};
use walkdir::WalkDir;

/// Decides whether an entry is excluded from an archive.
///
/// Receives the path relative to the archive root and whether the entry is a
/// directory; returning `true` excludes it. An excluded directory prunes its
/// whole subtree.
pub type ArchiveFilter = Box<dyn Fn(&Path, bool) -> bool + Send>;

/// Writes a gzip-compressed ustar archive of `source_dir` into `writer`.
///
/// Entries are visited in lexicographic order so identical trees produce
/// identical bytes. Only regular files are recorded; symbolic links, devices,
/// sockets, and named pipes are silently skipped, and directories are not
/// emitted as entries of their own. Entry names are relative to `source_dir`,
/// mode bits and modification times are preserved, and ownership is zeroed
/// for cross-host reproducibility. The compression level is fixed.
pub fn write_archive<W: Write>(
    writer: W,
    source_dir: &Path,
    filter: Option<&(dyn Fn(&Path, bool) -> bool + Send)>,
) -> io::Result<()> {
    let encoder = GzEncoder::new(writer, Compression::default());
    let mut builder = Builder::new(encoder);

    let mut entries = WalkDir::new(source_dir).sort_by_file_name().into_iter();
    while let Some(entry) = entries.next() {
        let entry = entry.map_err(io::Error::other)?;
        if entry.path() == source_dir {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(source_dir)
            .map_err(io::Error::other)?;
        let file_type = entry.file_type();
        if let Some(filter) = filter {
            if filter(relative, file_type.is_dir()) {
                if file_type.is_dir() {
                    entries.skip_current_dir();
                }
                continue;
            }
        }
        if !file_type.is_file() {
            continue;
        }

        let metadata = entry.metadata().map_err(io::Error::other)?;
        let mut header = Header::new_ustar();
        header.set_entry_type(EntryType::Regular);
        header.set_size(metadata.len());
        header.set_mode(metadata.permissions().mode());
        header.set_mtime(metadata.mtime().max(0) as u64);
        header.set_uid(0);
        header.set_gid(0);

        let mut file = fs::File::open(entry.path())?;
        builder.append_data(&mut header, relative, &mut file)?;
    }

    let encoder = builder.into_inner()?;
    encoder.finish()?;
    Ok(())
}

/// Extracts the regular files of a tar+gzip stream below `to_path`,
/// preserving mode bits.
///
/// With a non-empty `sub_path` only entries under that prefix are extracted,
/// re-rooted at `to_path`; an entry matching `sub_path` exactly is written to
/// `to_path` itself.
pub fn unpack_archive<R: Read>(reader: R, sub_path: &str, to_path: &Path) -> io::Result<()> {
    let decoder = GzDecoder::new(reader);
    let mut archive = tar::Archive::new(decoder);

    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry.path()?.into_owned();
        if name
            .components()
            .any(|component| !matches!(component, Component::Normal(_)))
        {
            return Err(io::Error::other(format!(
                "archive entry escapes the extraction root: {}",
                name.display()
            )));
        }
        let name_str = name.to_string_lossy().into_owned();
        if !sub_path.is_empty() && !name_str.starts_with(sub_path) {
            continue;
        }

        let target = if sub_path.is_empty() {
            to_path.join(&name)
        } else {
            let remainder = name_str[sub_path.len()..].trim_start_matches('/');
            if remainder.is_empty() {
                to_path.to_path_buf()
            } else {
                to_path.join(remainder)
            }
        };
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        let mode = entry.header().mode()?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(mode)
            .open(&target)?;
        io::copy(&mut entry, &mut file)?;

        if !sub_path.is_empty() && name_str == sub_path {
            break;
        }
    }

    Ok(())
}
