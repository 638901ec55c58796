//! Lexical path helpers

use std::io;
use std::path::{Component, Path, PathBuf};

/// Drop `.` and resolve `..` components without touching the filesystem
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Make `path` absolute against the working directory, then [`normalize`] it
pub fn absolute(path: &Path) -> io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(normalize(path))
    } else {
        Ok(normalize(&std::env::current_dir()?.join(path)))
    }
}

/// `target` expressed relative to the directory `base`; both absolute
pub fn relative(target: &Path, base: &Path) -> PathBuf {
    let target = normalize(target);
    let base = normalize(base);
    let mut t = target.components().peekable();
    let mut b = base.components().peekable();
    while let (Some(x), Some(y)) = (t.peek(), b.peek()) {
        if x != y {
            break;
        }
        t.next();
        b.next();
    }
    let mut out: PathBuf = b.map(|_| Component::ParentDir).collect();
    out.extend(t);
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(Path::new("/a/./b/../c")), PathBuf::from("/a/c"));
        assert_eq!(normalize(Path::new("/..")), PathBuf::from("/"));
        assert_eq!(normalize(Path::new("../x")), PathBuf::from("../x"));
    }

    #[test]
    fn test_absolute_keeps_absolute_paths() {
        assert_eq!(absolute(Path::new("/r/s/../t")).unwrap(), PathBuf::from("/r/t"));
        assert!(absolute(Path::new("rel")).unwrap().is_absolute());
    }

    #[test]
    fn test_relative() {
        assert_eq!(
            relative(Path::new("/out/a.b"), Path::new("/proj/a/b")),
            PathBuf::from("../../../out/a.b")
        );
        assert_eq!(relative(Path::new("/p/x/y"), Path::new("/p")), PathBuf::from("x/y"));
        assert_eq!(relative(Path::new("/p"), Path::new("/p")), PathBuf::from("."));
    }
}
