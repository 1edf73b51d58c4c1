//! The facade end to end: routing, handles, current directory and the
//! stamp/expire cycle across the built-in classes.

mod common;

use common::{ScriptedHost, remote, tar_with};
use hako_vfs::{
    ClassFlags, ClassId, OpenFlags, SetCtl, VfsClass, VfsConfig, VfsContext, VfsError,
};
use std::io::SeekFrom;

fn context(timeout_secs: u64) -> (VfsContext, tempfile::TempDir) {
    common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let config = VfsConfig {
        timeout_secs,
        temp_dir: Some(dir.path().to_path_buf()),
        ..VfsConfig::default()
    };
    (VfsContext::with_builtin(config), dir)
}

fn touch(ctx: &VfsContext, path: &str, data: &[u8]) {
    let fd = ctx.open(path, OpenFlags::create_truncate(), 0o644).unwrap();
    assert_eq!(ctx.write(fd, data).unwrap(), data.len());
    ctx.close(fd).unwrap();
}

fn slurp(ctx: &VfsContext, path: &str) -> Vec<u8> {
    let fd = ctx.open(path, OpenFlags::read(), 0).unwrap();
    let mut out = Vec::new();
    let mut buf = [0u8; 4];
    loop {
        let n = ctx.read(fd, &mut buf).unwrap();
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    ctx.close(fd).unwrap();
    out
}

// ============================================================================
// Stamps
// ============================================================================

#[test]
fn test_second_close_stamps_once() {
    let (ctx, _dir) = context(60);
    touch(&ctx, "/#mem/f", b"data");
    let (cid, id) = ctx.getid("/#mem/f").unwrap();
    assert!(ctx.gc().is_stamped(cid, id));

    let first = ctx.open("/#mem/f", OpenFlags::read(), 0).unwrap();
    assert!(ctx.gc().stamps().is_empty());
    let second = ctx.open("/#mem/f", OpenFlags::read(), 0).unwrap();

    ctx.close(first).unwrap();
    assert!(ctx.gc().stamps().is_empty());

    ctx.close(second).unwrap();
    let stamps = ctx.gc().stamps();
    assert_eq!(stamps.len(), 1);
    assert_eq!((stamps[0].class, stamps[0].id), (cid, id));
}

#[test]
fn test_expire_frees_idle_instance() {
    let (ctx, _dir) = context(0);
    touch(&ctx, "/#mem/f", b"data");
    assert_eq!(ctx.fill_names(), vec!["#mem/"]);

    ctx.timeout_handler();
    assert!(ctx.gc().stamps().is_empty());
    assert!(ctx.fill_names().is_empty());
    assert_eq!(ctx.next_timeout(), None);
    // Memory instances start over empty.
    assert!(matches!(ctx.stat("/#mem/f"), Err(VfsError::NotFound(_))));
}

#[test]
fn test_busy_instance_survives_until_forced() {
    let (ctx, _dir) = context(0);
    touch(&ctx, "/#mem/f", b"data");
    let (cid, id) = ctx.getid("/#mem/f").unwrap();
    let fd = ctx.open("/#mem/f", OpenFlags::read(), 0).unwrap();

    // Stamp it by hand while a handle is open.
    let class = ctx.class(cid).unwrap().clone();
    ctx.gc().add(cid, class.as_ref(), id);
    let before = ctx.gc().stamps()[0].time;

    ctx.expire(false);
    let stamps = ctx.gc().stamps();
    assert_eq!(stamps.len(), 1);
    assert!(stamps[0].time >= before);
    assert_eq!(ctx.fill_names().len(), 1);

    // Forcing frees it anyway and the handle goes stale.
    ctx.expire(true);
    assert!(ctx.fill_names().is_empty());
    assert!(ctx.gc().stamps().is_empty());
    assert!(matches!(ctx.close(fd), Err(VfsError::BadHandle)));
    assert_eq!(ctx.open_files(), 0);
}

#[test]
fn test_forced_expire_frees_nested_instance_first() {
    let host = ScriptedHost::default();
    host.list("", &[]);
    let fs = remote(host, "ls", ClassFlags::empty());
    let (mut ctx, _dir) = context(60);
    ctx.register(fs.clone());

    ctx.read_dir("/outer#ls").unwrap();
    ctx.read_dir("/outer#ls/inner#ls").unwrap();
    assert_eq!(ctx.gc().stamps().len(), 2);

    ctx.expire(true);
    assert_eq!(
        fs.subclass().freed.lock().clone(),
        vec!["/outer#ls/inner".to_string(), "/outer".to_string()]
    );
    assert!(ctx.fill_names().is_empty());
}

#[test]
fn test_cross_instance_rename_keeps_both_stamped() {
    let (ctx, _dir) = context(0);
    ctx.mkdir("/a#mem/d", 0o755).unwrap();
    ctx.mkdir("/b#mem/e", 0o755).unwrap();
    let (ca, a) = ctx.getid("/a#mem/d").unwrap();
    let (cb, b) = ctx.getid("/b#mem/e").unwrap();

    assert!(matches!(
        ctx.rename("/a#mem/d", "/b#mem/d"),
        Err(VfsError::CrossDeviceLink)
    ));
    assert_eq!(ctx.errno(), libc::EXDEV);
    assert!(matches!(
        ctx.link("/b#mem/e", "/a#mem/e"),
        Err(VfsError::CrossDeviceLink)
    ));
    assert!(ctx.gc().is_stamped(ca, a));
    assert!(ctx.gc().is_stamped(cb, b));

    ctx.expire(false);
    assert!(ctx.fill_names().is_empty());
}

#[test]
fn test_failed_second_lookup_keeps_first_stamped() {
    let host = ScriptedHost::default();
    host.offline.lock().push("/gone".to_string());
    let fs = remote(host, "ls", ClassFlags::empty());
    let (mut ctx, _dir) = context(60);
    ctx.register(fs.clone());

    assert!(matches!(
        ctx.rename("/h#ls/a", "/gone#ls/b"),
        Err(VfsError::NotFound(_))
    ));
    let (cid, id) = ctx.getid("/h#ls").unwrap();
    assert!(ctx.gc().is_stamped(cid, id));
    assert_eq!(ctx.gc().stamps().len(), 1);
    assert!(fs.subclass().mutations.lock().is_empty());
}

#[test]
fn test_current_directory_is_never_stamped() {
    let (ctx, _dir) = context(0);
    ctx.mkdir("/#mem/d", 0o755).unwrap();
    ctx.chdir("/#mem/d").unwrap();
    let (cid, id) = ctx.getid(".").unwrap();
    assert_eq!(ctx.gc().current(), Some((cid, id)));
    assert!(ctx.gc().stamps().is_empty());

    touch(&ctx, "f", b"x");
    assert!(ctx.gc().stamps().is_empty());
    ctx.expire(true);
    assert_eq!(slurp(&ctx, "f"), b"x");

    // Leaving stamps it, and it can then go.
    ctx.chdir("/").unwrap();
    assert!(ctx.gc().is_stamped(cid, id));
    assert_eq!(ctx.gc().current(), None);
    ctx.expire(false);
    assert!(ctx.fill_names().is_empty());
}

#[test]
fn test_chdir_into_missing_directory() {
    let (ctx, _dir) = context(60);
    let before = ctx.getcwd();
    assert!(matches!(ctx.chdir("/#mem/nope"), Err(VfsError::NotFound(_))));
    assert_eq!(ctx.errno(), libc::ENOENT);
    assert_eq!(ctx.getcwd(), before);
}

// ============================================================================
// Tar archives
// ============================================================================

#[test]
fn test_read_inside_tar() {
    let (ctx, dir) = context(60);
    let archive = tar_with(
        dir.path(),
        "src.tar",
        &[("README", b"read me"), ("lib/mod.rs", b"pub mod x;")],
    );
    let root = format!("{}#utar", archive.display());

    assert_eq!(slurp(&ctx, &format!("{root}/lib/mod.rs")), b"pub mod x;");
    let names: Vec<String> = ctx
        .read_dir(&root)
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, vec!["README", "lib"]);

    let st = ctx.stat(&format!("{root}/README")).unwrap();
    assert_eq!(st.size, 7);
    assert_eq!(st.perm(), 0o644);

    assert!(matches!(
        ctx.unlink(&format!("{root}/README")),
        Err(VfsError::ReadOnly)
    ));
    assert_eq!(ctx.errno(), libc::EROFS);
    assert!(!ctx.file_is_local(&root));
    assert_eq!(ctx.fill_names(), vec![format!("{root}/")]);
}

#[test]
fn test_tar_through_relative_path() {
    let (ctx, dir) = context(60);
    tar_with(dir.path(), "a.tar", &[("x", b"1")]);
    ctx.chdir(&dir.path().display().to_string()).unwrap();
    assert!(ctx.current_is_local());
    assert_eq!(slurp(&ctx, "a.tar#utar/x"), b"1");
    assert_eq!(slurp(&ctx, "./a.tar#utar/../a.tar#utar/x"), b"1");
}

#[test]
fn test_tar_inside_memory_is_unreadable() {
    let (ctx, _dir) = context(60);
    touch(&ctx, "/#mem/a.tar", b"not really");
    assert!(ctx.stat("/#mem/a.tar#utar/x").is_err());
}

#[test]
fn test_getlocalcopy_from_tar() {
    let (ctx, dir) = context(60);
    let archive = tar_with(dir.path(), "docs.tar", &[("guide.md", b"# Guide")]);
    let path = format!("{}#utar/guide.md", archive.display());

    let local = ctx.getlocalcopy(&path).unwrap();
    assert!(local.starts_with(dir.path()));
    assert_eq!(local.extension().unwrap(), "md");
    assert_eq!(std::fs::read(&local).unwrap(), b"# Guide");

    ctx.ungetlocalcopy(&path, &local, false).unwrap();
    assert!(!local.exists());
}

// ============================================================================
// Local files
// ============================================================================

#[test]
fn test_local_files_round_trip() {
    let (ctx, dir) = context(60);
    let base = dir.path().display().to_string();
    let path = format!("{base}/hello.txt");

    touch(&ctx, &path, b"hello world");
    assert_eq!(std::fs::read(dir.path().join("hello.txt")).unwrap(), b"hello world");

    let fd = ctx.open(&path, OpenFlags::read(), 0).unwrap();
    assert_eq!(ctx.lseek(fd, SeekFrom::Start(6)).unwrap(), 6);
    let mut buf = [0u8; 5];
    assert_eq!(ctx.read(fd, &mut buf).unwrap(), 5);
    assert_eq!(&buf, b"world");
    assert_eq!(ctx.fstat(fd).unwrap().size, 11);
    ctx.close(fd).unwrap();

    ctx.symlink("hello.txt", &format!("{base}/link")).unwrap();
    assert_eq!(ctx.readlink(&format!("{base}/link")).unwrap(), "hello.txt");
    ctx.rename(&path, &format!("{base}/moved.txt")).unwrap();
    assert!(ctx.stat(&path).is_err());

    // Local files are their own local copies.
    let moved = format!("{base}/moved.txt");
    assert_eq!(ctx.getlocalcopy(&moved).unwrap(), dir.path().join("moved.txt"));
    ctx.ungetlocalcopy(&moved, &dir.path().join("moved.txt"), false).unwrap();
    assert!(dir.path().join("moved.txt").exists());
    assert!(ctx.gc().stamps().is_empty());
}

#[test]
fn test_copy_between_classes() {
    let (ctx, dir) = context(60);
    let local = format!("{}/big.bin", dir.path().display());
    let data: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    touch(&ctx, &local, &data);

    let src = ctx.open(&local, OpenFlags::read(), 0).unwrap();
    let dst = ctx.open("/#mem/big.bin", OpenFlags::create(), 0o600).unwrap();
    let mut buf = vec![0u8; 4096];
    loop {
        let n = ctx.read(src, &mut buf).unwrap();
        if n == 0 {
            break;
        }
        ctx.write(dst, &buf[..n]).unwrap();
    }
    ctx.close(src).unwrap();
    ctx.close(dst).unwrap();

    assert_eq!(slurp(&ctx, "/#mem/big.bin"), data);
    assert!(matches!(
        ctx.link(&local, "/#mem/other"),
        Err(VfsError::CrossDeviceLink)
    ));
}

// ============================================================================
// Remote classes
// ============================================================================

#[test]
fn test_remote_temp_copy_through_facade() {
    let host = ScriptedHost::default();
    host.list("", &["-rw-r--r-- 1 me me 4 2024-01-02 10:00 notes.txt"]);
    host.put("notes.txt", b"v1\n\n");
    let fs = remote(host, "tmp", ClassFlags::USETMP);

    let (mut ctx, _dir) = context(60);
    let cid = ctx.register(fs.clone());
    assert_eq!(cid, ClassId(3));

    let path = "tmp://box/notes.txt";
    assert_eq!(ctx.canon(path), "/#tmp:box/notes.txt");
    let local = ctx.getlocalcopy(path).unwrap();
    assert_eq!(std::fs::read(&local).unwrap(), b"v1\n\n");

    std::fs::write(&local, b"v2").unwrap();
    ctx.ungetlocalcopy(path, &local, true).unwrap();
    assert_eq!(
        fs.subclass().stored.lock().clone(),
        vec![("notes.txt".to_string(), b"v2".to_vec())]
    );
    // The cached copy went away with the invalidated tree.
    assert!(!local.exists());
}

#[test]
fn test_setctl_routes_to_class() {
    let host = ScriptedHost::default();
    host.list("", &[]);
    let fs = remote(host, "ls", ClassFlags::empty());
    let (mut ctx, dir) = context(60);
    ctx.register(fs.clone());

    ctx.read_dir("/h#ls").unwrap();
    assert!(ctx.setctl("/h#ls", &SetCtl::Flush).unwrap());
    ctx.read_dir("/h#ls").unwrap();
    assert_eq!(fs.subclass().loads_of(""), 2);

    let log = dir.path().join("proto.log");
    assert!(ctx.setctl("/h#ls", &SetCtl::LogFile(log.clone())).unwrap());
    ctx.mkdir("/h#ls/d", 0o755).unwrap();
    let logged = std::fs::read_to_string(&log).unwrap();
    assert!(logged.contains("mutate /h#ls/d"));

    assert!(fs.nothingisopen(ctx.getid("/h#ls").unwrap().1));
}

#[test]
fn test_shutdown_releases_everything() {
    let (ctx, _dir) = context(60);
    touch(&ctx, "/a#mem/f", b"a");
    let _open = ctx.open("/b#mem/f", OpenFlags::create(), 0o644).unwrap();
    ctx.mkdir("/c#mem/d", 0o755).unwrap();
    ctx.chdir("/c#mem/d").unwrap();

    ctx.shutdown();
    assert!(ctx.fill_names().is_empty());
    assert!(ctx.gc().stamps().is_empty());
    assert_eq!(ctx.open_files(), 0);
}
