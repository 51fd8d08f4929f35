use crate::CoreError;
use std::fs;
use std::os::unix::fs::FileTypeExt;
use std::path::{Component, Path, PathBuf};
use stratum_schema::DEFAULT_KUBEFILE;
use tracing::debug;

/// A resolved build context: an absolute, symlink-free directory and the
/// instruction file inside (or outside) it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildContext {
    pub dir: PathBuf,
    pub kubefile: PathBuf,
}

/// Resolve `context` and locate the Kubefile, then check every file in the
/// context is readable.
///
/// `kubefile` defaults to `Kubefile`; when that default is absent a
/// lowercase `kubefile` is accepted. Relative names resolve against the
/// context directory.
pub fn resolve_context(context: &Path, kubefile: Option<&str>) -> Result<BuildContext, CoreError> {
    let dir = fs::canonicalize(context).map_err(|e| {
        CoreError::Validation(format!(
            "unable to resolve context directory {}: {e}",
            context.display()
        ))
    })?;
    if !dir.is_dir() {
        return Err(CoreError::Validation(format!(
            "context {} is not a directory",
            dir.display()
        )));
    }

    let kubefile = locate_kubefile(&dir, kubefile)?;
    validate_context_dir(&dir)?;
    debug!(
        "build context {} with {}",
        dir.display(),
        kubefile.display()
    );
    Ok(BuildContext { dir, kubefile })
}

fn locate_kubefile(dir: &Path, name: Option<&str>) -> Result<PathBuf, CoreError> {
    let given = name.unwrap_or(DEFAULT_KUBEFILE);
    let path = if Path::new(given).is_absolute() {
        PathBuf::from(given)
    } else {
        dir.join(given)
    };
    if path.is_file() {
        return Ok(path);
    }

    if given == DEFAULT_KUBEFILE {
        let lower = dir.join(DEFAULT_KUBEFILE.to_lowercase());
        if lower.is_file() {
            return Ok(lower);
        }
    }
    Err(CoreError::Validation(format!(
        "cannot locate kubefile {}",
        path.display()
    )))
}

/// Every regular file under `dir` must be readable. Symlinks and pipes are
/// not followed or opened.
pub fn validate_context_dir(dir: &Path) -> Result<(), CoreError> {
    let entries = fs::read_dir(dir).map_err(|e| {
        CoreError::Validation(format!("cannot read directory {}: {e}", dir.display()))
    })?;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_symlink() || file_type.is_fifo() {
            continue;
        }
        if file_type.is_dir() {
            validate_context_dir(&path)?;
            continue;
        }
        fs::File::open(&path).map_err(|e| {
            CoreError::Validation(format!("cannot access {}: {e}", path.display()))
        })?;
    }
    Ok(())
}

/// Lexically normalize a relative path, refusing to climb above its root.
pub(crate) fn clean_relative(path: &str) -> Result<PathBuf, CoreError> {
    let mut out = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return Err(CoreError::Validation(format!(
                        "path '{path}' escapes the build context"
                    )));
                }
            }
            Component::Prefix(_) => {
                return Err(CoreError::Validation(format!(
                    "unsupported path prefix in '{path}'"
                )));
            }
        }
    }
    Ok(out)
}

/// Path of a COPY source inside the context. The source must exist.
///
/// Intermediate directories are resolved through symlinks and must stay
/// under the context. A symlink as the last component is returned as is and
/// copied as a link, never followed.
pub(crate) fn resolve_copy_source(context: &Path, src: &str) -> Result<PathBuf, CoreError> {
    let relative = clean_relative(src)?;
    let Some(name) = relative.file_name() else {
        return Err(CoreError::Validation(format!(
            "COPY source '{src}' names the whole context"
        )));
    };
    let root = fs::canonicalize(context)?;
    let parent = match relative.parent() {
        Some(p) if !p.as_os_str().is_empty() => fs::canonicalize(root.join(p)).map_err(|_| {
            CoreError::Validation(format!(
                "COPY source '{src}' not found in {}",
                context.display()
            ))
        })?,
        _ => root.clone(),
    };
    if !parent.starts_with(&root) {
        return Err(CoreError::Validation(format!(
            "COPY source '{src}' resolves outside the build context"
        )));
    }

    let path = parent.join(name);
    if fs::symlink_metadata(&path).is_err() {
        return Err(CoreError::Validation(format!(
            "COPY source '{src}' not found in {}",
            context.display()
        )));
    }
    Ok(path)
}

/// Open a COPY source for reading its content, following a final symlink
/// only while the target stays inside the context.
pub(crate) fn read_copy_source(context: &Path, src: &str) -> Result<Option<String>, CoreError> {
    let path = resolve_copy_source(context, src)?;
    let real = fs::canonicalize(&path)?;
    if !real.starts_with(fs::canonicalize(context)?) {
        return Err(CoreError::Validation(format!(
            "COPY source '{src}' resolves outside the build context"
        )));
    }
    if !real.is_file() {
        return Ok(None);
    }
    Ok(Some(fs::read_to_string(real)?))
}
