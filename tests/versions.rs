use comfy_launcher::events::{Dispatcher, Event, EventReceiver};
use comfy_launcher::git::GitResolver;
use comfy_launcher::repo::{ProxyRule, RepositoryTarget, RepositoryUnavailable, SafeDirectory};
use comfy_launcher::versions::{Dimension, ProbeError, SystemVersionSource, VersionSource};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tempfile::TempDir;

fn has_git() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(["-c", "user.name=Tester", "-c", "user.email=tester@example.com"])
        .args(args)
        .current_dir(dir)
        .output()
        .expect("run git");
    assert!(
        out.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

fn commit(dir: &Path, file: &str, content: &str, message: &str) {
    std::fs::write(dir.join(file), content).unwrap();
    git(dir, &["add", file]);
    git(dir, &["commit", "-q", "-m", message]);
}

/// An untagged upstream with one commit and a clone of it.
struct Fixture {
    dir: TempDir,
    upstream: PathBuf,
    local: PathBuf,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let upstream = dir.path().join("upstream");
    let local = dir.path().join("ComfyUI");
    std::fs::create_dir(&upstream).unwrap();
    git(&upstream, &["init", "-q", "-b", "main"]);
    commit(&upstream, "main.py", "print('v1')\n", "Initial");
    git(
        dir.path(),
        &["clone", "-q", upstream.to_str().unwrap(), local.to_str().unwrap()],
    );
    Fixture {
        dir,
        upstream,
        local,
    }
}

/// `git` overrides the executable; `proxy` is the acceleration rule.
fn source(
    root: &Path,
    git: Option<PathBuf>,
    proxy: ProxyRule,
) -> (SystemVersionSource, EventReceiver) {
    let (dispatcher, events) = Dispatcher::channel();
    let resolver = Arc::new(GitResolver::with_candidates(
        git,
        Vec::new(),
        PathBuf::from("git"),
    ));
    let source = SystemVersionSource::new(
        "python3",
        RepositoryTarget::new(root, proxy),
        resolver,
        Arc::new(SafeDirectory::new(dispatcher)),
    );
    (source, events)
}

fn drain(events: &mut EventReceiver) -> Vec<Event> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test]
async fn test_kernel_without_tags_reports_short_commit() {
    if !has_git() {
        return;
    }
    let fx = fixture();
    let short = git(&fx.local, &["rev-parse", "--short", "HEAD"]);

    let (source, _events) = source(&fx.local, None, ProxyRule::None);
    let kernel = source.probe(Dimension::Kernel).await.unwrap();
    assert_eq!(kernel, format!("({short})"));
}

#[tokio::test]
async fn test_kernel_fetches_tags_published_after_clone() {
    if !has_git() {
        return;
    }
    let fx = fixture();
    git(&fx.upstream, &["tag", "v0.3.1"]);
    let short = git(&fx.local, &["rev-parse", "--short", "HEAD"]);

    let (source, _events) = source(&fx.local, None, ProxyRule::None);
    let kernel = source.probe(Dimension::Kernel).await.unwrap();
    assert_eq!(kernel, format!("v0.3.1 ({short})"));
    assert_eq!(git(&fx.local, &["tag", "--list"]), "v0.3.1");
}

#[tokio::test]
async fn test_kernel_missing_root() {
    if !has_git() {
        return;
    }
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("ComfyUI");

    let (source, _events) = source(&missing, None, ProxyRule::None);
    let err = source.probe(Dimension::Kernel).await.unwrap_err();
    assert!(
        matches!(
            err,
            ProbeError::Repository(RepositoryUnavailable::MissingRoot(ref p)) if p == &missing
        ),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn test_kernel_in_empty_repository_is_not_found() {
    if !has_git() {
        return;
    }
    let dir = TempDir::new().unwrap();
    git(dir.path(), &["init", "-q", "-b", "main"]);

    let (source, _events) = source(dir.path(), None, ProxyRule::None);
    let err = source.probe(Dimension::Kernel).await.unwrap_err();
    assert!(matches!(err, ProbeError::NotFound), "unexpected error: {err}");
}

#[cfg(unix)]
#[tokio::test]
async fn test_kernel_fetches_tags_through_proxy() {
    if !has_git() {
        return;
    }
    let fx = fixture();
    git(&fx.upstream, &["tag", "v0.3.1"]);
    // The real origin is unreachable offline; only the mirror can supply the tag.
    git(
        &fx.local,
        &["remote", "set-url", "origin", "https://github.com/org/repo"],
    );
    let mirror = fx.dir.path().join("mirror");
    let parent = mirror.join("https:").join("github.com").join("org");
    std::fs::create_dir_all(&parent).unwrap();
    git(
        &parent,
        &["clone", "-q", "--bare", fx.upstream.to_str().unwrap(), "repo"],
    );
    let short = git(&fx.local, &["rev-parse", "--short", "HEAD"]);

    let rule = ProxyRule::Custom(format!("file://{}/", mirror.display()));
    let (source, _events) = source(&fx.local, None, rule);
    let kernel = source.probe(Dimension::Kernel).await.unwrap();
    assert_eq!(kernel, format!("v0.3.1 ({short})"));
}

/// A `git` that reports dubious ownership from `rev-parse --is-inside-work-tree`
/// (only the first time when `once`) and records `config --global` calls.
#[cfg(unix)]
fn dubious_git(dir: &Path, once: bool) -> (PathBuf, PathBuf) {
    use std::os::unix::fs::PermissionsExt;

    let script = dir.join("fake-git");
    let log = dir.join("global-config.log");
    let marker = dir.join("reported");
    let mark = if once {
        format!("touch '{}'; ", marker.display())
    } else {
        String::new()
    };
    std::fs::write(
        &script,
        format!(
            "#!/bin/sh\n\
             if [ \"$1\" = config ] && [ \"$2\" = --global ]; then echo \"$*\" >> '{log}'; exit 0; fi\n\
             if [ \"$1\" = rev-parse ] && [ \"$2\" = --is-inside-work-tree ] && [ ! -e '{marker}' ]; then \
             {mark}echo \"fatal: detected dubious ownership in repository at '$PWD'\" >&2; exit 128; fi\n\
             exec git \"$@\"\n",
            log = log.display(),
            marker = marker.display(),
        ),
    )
    .unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    (script, log)
}

#[cfg(unix)]
fn logged_lines(log: &Path) -> Vec<String> {
    std::fs::read_to_string(log)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

#[cfg(unix)]
#[tokio::test]
async fn test_dubious_ownership_is_remediated_once_and_retried() {
    if !has_git() {
        return;
    }
    let fx = fixture();
    let (script, log) = dubious_git(fx.dir.path(), true);

    let (source, mut events) = source(&fx.local, Some(script), ProxyRule::None);
    let status = source.probe(Dimension::Git).await.unwrap();
    assert_eq!(status, "ok (configured)");

    let lines = logged_lines(&log);
    assert_eq!(lines.len(), 1, "config calls: {lines:?}");
    assert!(lines[0].contains("safe.directory"));
    assert!(lines[0].contains(fx.local.to_str().unwrap()));

    let marked: Vec<_> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            Event::SafeDirectoryMarked { root } => Some(root),
            _ => None,
        })
        .collect();
    assert_eq!(marked, vec![fx.local.clone()]);

    let short = git(&fx.local, &["rev-parse", "--short", "HEAD"]);
    assert_eq!(
        source.probe(Dimension::Kernel).await.unwrap(),
        format!("({short})")
    );
    assert_eq!(logged_lines(&log).len(), 1);
}

#[cfg(unix)]
#[tokio::test]
async fn test_persistent_dubious_ownership_is_not_remediated_twice() {
    if !has_git() {
        return;
    }
    let fx = fixture();
    let (script, log) = dubious_git(fx.dir.path(), false);

    let (source, _events) = source(&fx.local, Some(script), ProxyRule::None);
    for _ in 0..2 {
        let err = source.probe(Dimension::Kernel).await.unwrap_err();
        assert!(
            matches!(
                err,
                ProbeError::Repository(RepositoryUnavailable::NotARepository { ref detail })
                    if detail.contains("dubious ownership")
            ),
            "unexpected error: {err}"
        );
    }
    assert_eq!(logged_lines(&log).len(), 1);
}
