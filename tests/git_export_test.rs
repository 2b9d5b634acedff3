use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tempfile::TempDir;

use flake_resolve::{
    eval::JsonEvaluator,
    fetch::{CommandFetcher, VersionControl},
    flake::{LockFile, LOCK_FILE_NAME},
    git::GitCli,
    resolve_flake,
    storage::FilesystemStore,
    FlakeContext, FlakeRef, GlobalRegistry, LockPolicy, RefKind, Settings,
};

/// Helper to run git commands in a directory
fn git_command(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .current_dir(dir)
        .args(args)
        .output()
        .expect("Failed to run git command");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

/// Create a repository with two commits
fn create_test_repo(dir: &Path, name: &str, files: &[(&str, &str)]) -> PathBuf {
    let repo_dir = dir.join(name);
    fs::create_dir(&repo_dir).expect("Failed to create repo dir");

    git_command(&repo_dir, &["init", "--quiet"]);
    git_command(&repo_dir, &["config", "user.name", "Test User"]);
    git_command(&repo_dir, &["config", "user.email", "test@example.com"]);
    git_command(&repo_dir, &["config", "commit.gpgsign", "false"]);

    fs::write(repo_dir.join("README"), "initial").unwrap();
    git_command(&repo_dir, &["add", "."]);
    git_command(&repo_dir, &["commit", "--quiet", "-m", "Initial commit"]);

    for (file, content) in files {
        fs::write(repo_dir.join(file), content).unwrap();
    }
    git_command(&repo_dir, &["add", "."]);
    git_command(&repo_dir, &["commit", "--quiet", "-m", "Second commit"]);

    repo_dir
}

fn git_cli(temp: &TempDir) -> (Arc<FilesystemStore>, GitCli) {
    let store = Arc::new(FilesystemStore::new(temp.path().join("store")).unwrap());
    store.initialize().unwrap();
    let git = GitCli::new(store.clone(), temp.path().join("cache/git"));
    (store, git)
}

#[test]
fn test_export_clean_working_tree() {
    let temp = TempDir::new().unwrap();
    let repo = create_test_repo(temp.path(), "repo", &[("file1.txt", "content 1")]);
    let (_store, git) = git_cli(&temp);

    let head = git_command(&repo, &["rev-parse", "HEAD"]);
    let tree = git.export(&repo.to_string_lossy(), None, None).unwrap();

    assert_eq!(tree.rev.as_ref().map(|r| r.as_str()), Some(head.trim()));
    assert_eq!(tree.rev_count, Some(2));
    assert!(tree.last_modified.unwrap() > 0);
    assert!(tree.ref_name.is_some());
    assert_eq!(
        fs::read_to_string(tree.store_path.join("file1.txt")).unwrap(),
        "content 1"
    );
    assert!(!tree.store_path.join(".git").exists());
}

#[test]
fn test_export_dirty_working_tree() {
    let temp = TempDir::new().unwrap();
    let repo = create_test_repo(temp.path(), "repo", &[("file1.txt", "content 1")]);
    let (_store, git) = git_cli(&temp);

    fs::write(repo.join("file1.txt"), "changed").unwrap();
    fs::write(repo.join("untracked.txt"), "ignored").unwrap();

    let tree = git.export(&repo.to_string_lossy(), None, None).unwrap();
    assert!(tree.rev.is_none());
    assert!(tree.rev_count.is_none());
    assert_eq!(
        fs::read_to_string(tree.store_path.join("file1.txt")).unwrap(),
        "changed"
    );
    assert!(!tree.store_path.join("untracked.txt").exists());
}

#[test]
fn test_export_remote_by_rev() {
    let temp = TempDir::new().unwrap();
    let repo = create_test_repo(temp.path(), "remote", &[("file1.txt", "v1")]);
    let first = git_command(&repo, &["rev-parse", "HEAD"]);
    fs::write(repo.join("file1.txt"), "v2").unwrap();
    git_command(&repo, &["commit", "--quiet", "-am", "Third commit"]);

    let (_store, git) = git_cli(&temp);
    let url = format!("file://{}", repo.display());

    let latest = git.export(&url, None, None).unwrap();
    assert_eq!(latest.rev_count, Some(3));
    assert_eq!(fs::read_to_string(latest.store_path.join("file1.txt")).unwrap(), "v2");

    let rev = flake_resolve::Rev::parse(first.trim()).unwrap();
    let pinned = git.export(&url, None, Some(&rev)).unwrap();
    assert_eq!(pinned.rev, Some(rev));
    assert_eq!(fs::read_to_string(pinned.store_path.join("file1.txt")).unwrap(), "v1");
}

#[test]
fn test_mark_tracked() {
    let temp = TempDir::new().unwrap();
    let repo = create_test_repo(temp.path(), "repo", &[("file1.txt", "content 1")]);
    let (_store, git) = git_cli(&temp);

    fs::write(repo.join(LOCK_FILE_NAME), "{}").unwrap();
    git.mark_tracked(&repo, Path::new(LOCK_FILE_NAME)).unwrap();

    let files = git_command(&repo, &["ls-files"]);
    assert!(files.lines().any(|f| f == LOCK_FILE_NAME));
}

#[test]
fn test_lock_local_flake_with_git_input() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().canonicalize().unwrap();

    let dep = create_test_repo(
        &root,
        "dep",
        &[(
            "flake.json",
            r#"{"edition": 201909, "outputs": {"__lambda": {"formals": ["self"], "body": {"answer": 42}}}}"#,
        )],
    );
    let dep_head = git_command(&dep, &["rev-parse", "HEAD"]);

    let top_manifest = format!(
        r#"{{"edition": 201909,
            "inputs": {{"dep": {{"uri": "git+file://{}"}}}},
            "outputs": {{"__lambda": {{"formals": ["self", "dep"], "body": {{"dep": {{"__input": "dep"}}}}}}}}}}"#,
        dep.display()
    );
    let top = create_test_repo(&root, "top", &[("flake.json", top_manifest.as_str())]);

    let settings = Settings {
        store_dir: root.join("store"),
        cache_dir: root.join("cache"),
        flake_registry: root.join("no-registry.json").to_string_lossy().into_owned(),
        user_registry_path: root.join("user-registry.json"),
        ..Settings::default()
    };
    let store = Arc::new(FilesystemStore::new(&settings.store_dir).unwrap());
    store.initialize().unwrap();
    let fetcher = CommandFetcher::new(store.clone(), settings.cache_dir.clone());
    let vcs = Arc::new(fetcher.git().clone());
    let ctx = FlakeContext::new(
        settings,
        Arc::new(fetcher),
        store,
        Arc::new(JsonEvaluator::new()),
        vcs,
    )
    .with_global_registry(Arc::new(GlobalRegistry::new()));

    let resolved = resolve_flake(&ctx, &FlakeRef::path(&top), LockPolicy::Update).unwrap();

    let locked = &resolved.lock_file.inputs["dep"];
    assert!(matches!(locked.reference.kind, RefKind::Git { .. }));
    assert_eq!(locked.reference.rev.as_ref().map(|r| r.as_str()), Some(dep_head.trim()));

    let lock_path = top.join(LOCK_FILE_NAME);
    assert_eq!(LockFile::read(&lock_path).unwrap(), resolved.lock_file);
    let files = git_command(&top, &["ls-files"]);
    assert!(files.lines().any(|f| f == LOCK_FILE_NAME));

    let value = resolved.call(&ctx).unwrap();
    let Some(flake_resolve::eval::Value::Lazy(dep_input)) = value.get("dep").cloned() else {
        panic!("expected a lazy input in {:?}", value);
    };
    let dep_value = dep_input.force(&ctx).unwrap();
    assert_eq!(
        dep_value.get("answer"),
        Some(&flake_resolve::eval::Value::Int(42))
    );
}
