use log::{debug, warn};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Suffix appended to files that are being written but not yet published.
const STAGING_SUFFIX: &str = ".partial";

/// Returns the `.bed`, `.bim` and `.fam` paths sharing the stem of `bed`.
pub fn plink_fileset(bed: &Path) -> [PathBuf; 3] {
    [
        bed.with_extension("bed"),
        bed.with_extension("bim"),
        bed.with_extension("fam"),
    ]
}

/// Replaces the final extension of `path` with `ext` (given without a dot).
///
/// Dotfiles have no stem to keep, so they are rejected.
pub fn change_extname(path: &Path, ext: &str) -> io::Result<PathBuf> {
    let is_dotfile = path
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with('.'));
    if is_dotfile || path.file_name().is_none() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "invalid file name '{}': cannot change the extension of a dotfile",
                path.display()
            ),
        ));
    }
    Ok(path.with_extension(ext))
}

/// Appends `.ext` to the file name of `path`, keeping any existing extension.
pub fn append_extension(path: &Path, ext: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}

/// Resolves `path` against `base` unless it is already absolute.
pub fn resolve_against(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Returns every path in `paths` that does not exist or has zero length.
pub fn missing_or_empty(paths: &[PathBuf]) -> Vec<PathBuf> {
    paths
        .iter()
        .filter(|path| match fs::metadata(path) {
            Ok(meta) => !meta.is_file() || meta.len() == 0,
            Err(_) => true,
        })
        .cloned()
        .collect()
}

/// Fails unless `path` is a regular file that can be opened for reading.
pub fn ensure_readable(path: &Path) -> io::Result<()> {
    let meta = fs::metadata(path)?;
    if !meta.is_file() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "not a regular file",
        ));
    }
    File::open(path).map(drop)
}

/// A file written under a temporary sibling name and renamed into place by
/// [`publish_all`]. Unpublished staged files are removed on drop.
#[derive(Debug)]
pub struct StagedFile {
    target: PathBuf,
    staging: PathBuf,
    writer: Option<BufWriter<File>>,
    published: bool,
}

impl StagedFile {
    pub fn create(target: &Path) -> io::Result<Self> {
        let mut name = target
            .file_name()
            .map(OsString::from)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("'{}' has no file name", target.display()),
                )
            })?;
        name.push(STAGING_SUFFIX);
        let staging = target.with_file_name(name);
        let file = File::create(&staging)?;
        Ok(Self {
            target: target.to_path_buf(),
            staging,
            writer: Some(BufWriter::new(file)),
            published: false,
        })
    }

    pub fn writer(&mut self) -> io::Result<&mut BufWriter<File>> {
        self.writer.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "staged file is already closed")
        })
    }

    fn finish(&mut self) -> io::Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        Ok(())
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if self.published {
            return;
        }
        self.writer.take();
        if let Err(e) = fs::remove_file(&self.staging) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(
                    "Could not remove staged file {}: {e}",
                    self.staging.display()
                );
            }
        }
    }
}

/// Flushes every staged file, then renames them into place.
///
/// Nothing is renamed unless every file flushed cleanly. When a rename fails,
/// the targets already renamed are moved back to their staging names, so
/// either the whole set is published or none of it is.
pub fn publish_all(staged: &mut [StagedFile]) -> io::Result<Vec<PathBuf>> {
    for file in staged.iter_mut() {
        file.finish()?;
    }
    for (i, file) in staged.iter().enumerate() {
        if let Err(e) = fs::rename(&file.staging, &file.target) {
            for done in &staged[..i] {
                if let Err(undo) = fs::rename(&done.target, &done.staging) {
                    warn!(
                        "Could not withdraw {} after a failed publish: {undo}",
                        done.target.display()
                    );
                }
            }
            return Err(e);
        }
    }
    let mut published = Vec::with_capacity(staged.len());
    for file in staged.iter_mut() {
        file.published = true;
        debug!("Published {}", file.target.display());
        published.push(file.target.clone());
    }
    Ok(published)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn plink_fileset_shares_the_stem() {
        let [bed, bim, fam] = plink_fileset(Path::new("/data/run1.zcall.bed"));
        assert_eq!(bed, PathBuf::from("/data/run1.zcall.bed"));
        assert_eq!(bim, PathBuf::from("/data/run1.zcall.bim"));
        assert_eq!(fam, PathBuf::from("/data/run1.zcall.fam"));
    }

    #[test]
    fn change_extname_rejects_dotfiles() {
        assert_eq!(
            change_extname(Path::new("out/merged.bed"), "parts").unwrap(),
            PathBuf::from("out/merged.parts")
        );
        assert!(change_extname(Path::new("out/.hidden"), "txt").is_err());
    }

    #[test]
    fn append_extension_keeps_existing_suffixes() {
        assert_eq!(
            append_extension(Path::new("work/run1.genosnp"), "bed"),
            PathBuf::from("work/run1.genosnp.bed")
        );
        assert_eq!(
            resolve_against(Path::new("/work"), Path::new("run1.sim")),
            PathBuf::from("/work/run1.sim")
        );
        assert_eq!(
            resolve_against(Path::new("/work"), Path::new("/data/run1.sim")),
            PathBuf::from("/data/run1.sim")
        );
    }

    #[test]
    fn empty_files_count_as_missing() {
        let dir = tempdir().expect("tempdir");
        let full = dir.path().join("full.txt");
        let empty = dir.path().join("empty.txt");
        let absent = dir.path().join("absent.txt");
        fs::write(&full, b"x").unwrap();
        fs::write(&empty, b"").unwrap();

        let missing = missing_or_empty(&[full.clone(), empty.clone(), absent.clone()]);
        assert_eq!(missing, vec![empty, absent]);
        assert!(ensure_readable(&full).is_ok());
        assert!(ensure_readable(dir.path()).is_err());
    }

    #[test]
    fn unpublished_staged_files_are_removed() {
        let dir = tempdir().expect("tempdir");
        let target = dir.path().join("out.txt");
        {
            let mut staged = StagedFile::create(&target).unwrap();
            staged.writer().unwrap().write_all(b"abc").unwrap();
        }
        assert!(!target.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn failed_rename_withdraws_earlier_targets() {
        let dir = tempdir().expect("tempdir");
        let first = dir.path().join("calls.bed");
        let blocked = dir.path().join("calls.bim");
        fs::create_dir(&blocked).unwrap();
        fs::write(blocked.join("keep"), "x").unwrap();

        let mut staged = vec![
            StagedFile::create(&first).unwrap(),
            StagedFile::create(&blocked).unwrap(),
        ];
        for file in staged.iter_mut() {
            file.writer().unwrap().write_all(b"data").unwrap();
        }
        assert!(publish_all(&mut staged).is_err());
        drop(staged);

        assert!(!first.exists());
        assert!(blocked.join("keep").is_file());
        let mut left: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(left, vec!["calls.bim"]);
    }

    #[test]
    fn publish_renames_into_place() {
        let dir = tempdir().expect("tempdir");
        let targets = [dir.path().join("a.txt"), dir.path().join("b.txt")];
        let mut staged: Vec<StagedFile> = targets
            .iter()
            .map(|t| StagedFile::create(t).unwrap())
            .collect();
        for file in staged.iter_mut() {
            file.writer().unwrap().write_all(b"data").unwrap();
        }
        let published = publish_all(&mut staged).unwrap();
        drop(staged);
        assert_eq!(published, targets.to_vec());
        for target in &targets {
            assert_eq!(fs::read(target).unwrap(), b"data");
        }
    }
}
