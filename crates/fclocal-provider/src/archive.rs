//! Tar helpers for build contexts and archive downloads

use crate::{ProviderError, Result};
use std::io::{Cursor, Write};
use std::path::Path;

/// Pack a build context directory into a tar archive
///
/// Every entry under `context` is included. The archive is held in memory
/// since the engine API takes the context as one body.
pub fn pack_context(context: &Path) -> Result<Vec<u8>> {
    if !context.is_dir() {
        return Err(ProviderError::BuildError(format!(
            "build context {} is not a directory",
            context.display()
        )));
    }

    let mut tar_data = Vec::new();
    {
        let cursor = Cursor::new(&mut tar_data);
        let mut builder = tar::Builder::new(cursor);
        add_dir_to_tar(&mut builder, context, Path::new(""))?;
        builder.finish()?;
    }

    Ok(tar_data)
}

/// Recursively add directory contents to tar
fn add_dir_to_tar<W: Write>(
    builder: &mut tar::Builder<W>,
    base: &Path,
    prefix: &Path,
) -> Result<()> {
    let mut entries = std::fs::read_dir(base)?.collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let name = prefix.join(entry.file_name());

        if path.is_dir() {
            builder.append_dir(&name, &path)?;
            add_dir_to_tar(builder, &path, &name)?;
        } else if path.is_file() {
            builder.append_path_with_name(&path, &name)?;
        }
    }

    Ok(())
}

/// Extract a tar archive into a directory, creating it if needed
pub fn unpack_archive(tar_data: &[u8], dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    let mut archive = tar::Archive::new(Cursor::new(tar_data));
    archive.unpack(dest)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_and_unpack_context() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("Dockerfile"), "FROM scratch\n").unwrap();
        std::fs::create_dir_all(src.path().join("lib/nested")).unwrap();
        std::fs::write(src.path().join("lib/nested/a.txt"), "a").unwrap();
        std::fs::create_dir_all(src.path().join(".git")).unwrap();
        std::fs::write(src.path().join(".git/HEAD"), "ref").unwrap();

        let tar = pack_context(src.path()).unwrap();

        let dest = tempfile::tempdir().unwrap();
        let out = dest.path().join("out");
        unpack_archive(&tar, &out).unwrap();
        assert_eq!(std::fs::read_to_string(out.join("Dockerfile")).unwrap(), "FROM scratch\n");
        assert_eq!(std::fs::read_to_string(out.join("lib/nested/a.txt")).unwrap(), "a");
        assert_eq!(std::fs::read_to_string(out.join(".git/HEAD")).unwrap(), "ref");
    }

    #[test]
    fn test_pack_rejects_missing_context() {
        let tmp = tempfile::tempdir().unwrap();
        let err = pack_context(&tmp.path().join("missing")).unwrap_err();
        assert!(matches!(err, ProviderError::BuildError(_)));
    }
}
