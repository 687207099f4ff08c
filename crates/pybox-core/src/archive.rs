//! Unpacking of `install_only` runtime archives.

use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use flate2::read::GzDecoder;
use pybox_domain::ArchiveFormat;
use tar::Archive;

/// Unpack `bytes` into `dest`, dropping the archive's single top-level directory.
///
/// # Errors
/// Fails on corrupt streams and on entries that would land outside `dest`.
pub fn unpack(bytes: &[u8], format: ArchiveFormat, dest: &Path) -> Result<()> {
    match format {
        ArchiveFormat::TarGz => unpack_tar(GzDecoder::new(bytes), dest),
        ArchiveFormat::TarZst => {
            let decoder =
                zstd::stream::read::Decoder::new(bytes).context("opening zstd stream")?;
            unpack_tar(decoder, dest)
        }
    }
}

fn unpack_tar<R: Read>(reader: R, dest: &Path) -> Result<()> {
    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);
    for entry in archive.entries().context("reading archive entries")? {
        let mut entry = entry.context("reading archive entry")?;
        let path = entry.path().context("reading archive entry path")?.into_owned();
        let Some(relative) = strip_top_level(&path)? else {
            continue;
        };
        reject_symlinked_parent(dest, &relative)?;
        let target = dest.join(&relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        if entry.header().entry_type().is_hard_link() {
            let link = entry
                .link_name()
                .context("reading hard link target")?
                .ok_or_else(|| anyhow!("hard link {} has no target", path.display()))?
                .into_owned();
            let Some(link_relative) = strip_top_level(&link)? else {
                bail!("hard link {} points at the archive root", path.display());
            };
            reject_symlinked_parent(dest, &link_relative)?;
            let source = dest.join(link_relative);
            fs::hard_link(&source, &target).with_context(|| {
                format!("linking {} to {}", target.display(), source.display())
            })?;
            continue;
        }
        if entry.header().entry_type().is_symlink() {
            let link = entry
                .link_name()
                .context("reading symlink target")?
                .ok_or_else(|| anyhow!("symlink {} has no target", path.display()))?;
            check_symlink_target(&relative, &link)?;
        }
        entry
            .unpack(&target)
            .with_context(|| format!("extracting {}", target.display()))?;
    }
    Ok(())
}

/// A symlink at `relative` (inside the extraction directory) must point somewhere inside it.
fn check_symlink_target(relative: &Path, link: &Path) -> Result<()> {
    let mut depth = relative.parent().map_or(0, |parent| parent.components().count());
    for component in link.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(_) => depth += 1,
            Component::ParentDir if depth > 0 => depth -= 1,
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                bail!(
                    "symlink {} -> {} escapes the extraction directory",
                    relative.display(),
                    link.display()
                );
            }
        }
    }
    Ok(())
}

/// Writing beneath a symlink already unpacked into `dest` could land anywhere.
fn reject_symlinked_parent(dest: &Path, relative: &Path) -> Result<()> {
    let Some(parent) = relative.parent() else {
        return Ok(());
    };
    let mut current = dest.to_path_buf();
    for component in parent.components() {
        current.push(component);
        let is_symlink = fs::symlink_metadata(&current)
            .map(|meta| meta.file_type().is_symlink())
            .unwrap_or(false);
        if is_symlink {
            bail!(
                "archive entry {} is written through symlink {}",
                relative.display(),
                current.display()
            );
        }
    }
    Ok(())
}

/// Drop the first normal component. `None` means the entry is the top-level directory itself.
fn strip_top_level(path: &Path) -> Result<Option<PathBuf>> {
    let mut stripped = PathBuf::new();
    let mut skipped = false;
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) if skipped => stripped.push(part),
            Component::Normal(_) => skipped = true,
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                bail!(
                    "archive entry {} escapes the extraction directory",
                    path.display()
                );
            }
        }
    }
    Ok((!stripped.as_os_str().is_empty()).then_some(stripped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tar::{Builder, EntryType, Header};
    use tempfile::tempdir;

    fn file_header(size: usize, mode: u32) -> Header {
        let mut header = Header::new_gnu();
        header.set_size(size as u64);
        header.set_mode(mode);
        header.set_entry_type(EntryType::Regular);
        header
    }

    fn runtime_tar() -> Vec<u8> {
        let mut builder = Builder::new(Vec::new());
        let mut dir = Header::new_gnu();
        dir.set_entry_type(EntryType::Directory);
        dir.set_mode(0o755);
        dir.set_size(0);
        builder
            .append_data(&mut dir, "./python/", std::io::empty())
            .unwrap();
        let script = b"#!/bin/sh\necho python\n";
        builder
            .append_data(
                &mut file_header(script.len(), 0o755),
                "./python/bin/python3",
                &script[..],
            )
            .unwrap();
        let module = b"VALUE = 1\n";
        builder
            .append_data(
                &mut file_header(module.len(), 0o644),
                "python/lib/site.py",
                &module[..],
            )
            .unwrap();
        let mut link = Header::new_gnu();
        link.set_entry_type(EntryType::Link);
        link.set_size(0);
        link.set_mode(0o755);
        link.set_link_name("python/bin/python3").unwrap();
        builder
            .append_data(&mut link, "python/bin/python3.12", std::io::empty())
            .unwrap();
        builder.into_inner().unwrap()
    }

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn unpacks_gzip_and_strips_top_level() {
        let dest = tempdir().unwrap();
        unpack(&gzip(&runtime_tar()), ArchiveFormat::TarGz, dest.path()).unwrap();
        assert!(dest.path().join("bin/python3").is_file());
        assert_eq!(
            fs::read_to_string(dest.path().join("lib/site.py")).unwrap(),
            "VALUE = 1\n"
        );
        assert!(!dest.path().join("python").exists());
        assert_eq!(
            fs::read(dest.path().join("bin/python3.12")).unwrap(),
            fs::read(dest.path().join("bin/python3")).unwrap()
        );
    }

    #[test]
    fn unpacks_zstd() {
        let dest = tempdir().unwrap();
        let compressed = zstd::encode_all(&runtime_tar()[..], 0).unwrap();
        unpack(&compressed, ArchiveFormat::TarZst, dest.path()).unwrap();
        assert!(dest.path().join("bin/python3").is_file());
    }

    #[cfg(unix)]
    #[test]
    fn preserves_executable_bit() {
        use std::os::unix::fs::PermissionsExt;
        let dest = tempdir().unwrap();
        unpack(&gzip(&runtime_tar()), ArchiveFormat::TarGz, dest.path()).unwrap();
        let mode = fs::metadata(dest.path().join("bin/python3"))
            .unwrap()
            .permissions()
            .mode();
        assert_ne!(mode & 0o111, 0);
    }

    #[test]
    fn rejects_parent_traversal() {
        let mut header = file_header(4, 0o644);
        let name = b"python/../../evil.txt";
        header.as_old_mut().name[..name.len()].copy_from_slice(name);
        header.set_cksum();
        let mut builder = Builder::new(Vec::new());
        builder.append(&header, &b"evil"[..]).unwrap();
        let tar = builder.into_inner().unwrap();

        let root = tempdir().unwrap();
        let dest = root.path().join("stage");
        fs::create_dir(&dest).unwrap();
        let err = unpack(&gzip(&tar), ArchiveFormat::TarGz, &dest).unwrap_err();
        assert!(err.to_string().contains("escapes"), "{err}");
        assert!(!root.path().join("evil.txt").exists());
    }

    #[cfg(unix)]
    fn symlink_header(target: &[u8]) -> Header {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        header.set_mode(0o777);
        header.as_old_mut().linkname[..target.len()].copy_from_slice(target);
        header
    }

    #[cfg(unix)]
    #[test]
    fn rejects_symlink_pointing_outside() {
        let root = tempdir().unwrap();
        let outside = root.path().join("outside");
        fs::create_dir(&outside).unwrap();
        let dest = root.path().join("stage");
        fs::create_dir(&dest).unwrap();

        let mut builder = Builder::new(Vec::new());
        let mut link = symlink_header(outside.to_str().unwrap().as_bytes());
        builder
            .append_data(&mut link, "python/lib", std::io::empty())
            .unwrap();
        builder
            .append_data(&mut file_header(4, 0o644), "python/lib/evil.txt", &b"evil"[..])
            .unwrap();
        let tar = builder.into_inner().unwrap();

        let err = unpack(&gzip(&tar), ArchiveFormat::TarGz, &dest).unwrap_err();
        assert!(err.to_string().contains("escapes"), "{err}");
        assert!(!outside.join("evil.txt").exists());

        let mut builder = Builder::new(Vec::new());
        let mut relative = symlink_header(b"../../../outside");
        builder
            .append_data(&mut relative, "python/bin/lib", std::io::empty())
            .unwrap();
        let tar = builder.into_inner().unwrap();
        assert!(unpack(&gzip(&tar), ArchiveFormat::TarGz, &dest).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn rejects_writes_through_symlinked_directory() {
        let dest = tempdir().unwrap();
        let mut builder = Builder::new(Vec::new());
        let mut link = symlink_header(b"bin");
        builder
            .append_data(&mut link, "python/alias", std::io::empty())
            .unwrap();
        builder
            .append_data(&mut file_header(4, 0o644), "python/alias/evil.txt", &b"evil"[..])
            .unwrap();
        let tar = builder.into_inner().unwrap();

        let err = unpack(&gzip(&tar), ArchiveFormat::TarGz, dest.path()).unwrap_err();
        assert!(err.to_string().contains("through symlink"), "{err}");
        assert!(!dest.path().join("bin/evil.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn keeps_relative_symlinks_inside_target() {
        let dest = tempdir().unwrap();
        let mut builder = Builder::new(Vec::new());
        let script = b"#!/bin/sh\n";
        builder
            .append_data(
                &mut file_header(script.len(), 0o755),
                "python/bin/python3",
                &script[..],
            )
            .unwrap();
        let mut link = symlink_header(b"python3");
        builder
            .append_data(&mut link, "python/bin/python", std::io::empty())
            .unwrap();
        let tar = builder.into_inner().unwrap();
        unpack(&gzip(&tar), ArchiveFormat::TarGz, dest.path()).unwrap();
        let link = fs::symlink_metadata(dest.path().join("bin/python")).unwrap();
        assert!(link.file_type().is_symlink());
        assert!(dest.path().join("bin/python").is_file());
    }

    #[test]
    fn strip_top_level_handles_curdir_and_root_entry() {
        assert_eq!(strip_top_level(Path::new("./python/")).unwrap(), None);
        assert_eq!(
            strip_top_level(Path::new("./python/bin/python3")).unwrap(),
            Some(PathBuf::from("bin/python3"))
        );
        assert!(strip_top_level(Path::new("/etc/passwd")).is_err());
    }

    #[test]
    fn corrupt_stream_fails() {
        let dest = tempdir().unwrap();
        assert!(unpack(b"not an archive", ArchiveFormat::TarGz, dest.path()).is_err());
    }
}
