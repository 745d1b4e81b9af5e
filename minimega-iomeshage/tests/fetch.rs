use std::time::Duration;

use tempfile::TempDir;
use tokio::time::sleep;

use minimega_iomeshage::{Error, Iom, PART_SIZE};
use minimega_meshage::{Config, Node};

async fn spawn_pair() -> (Iom, TempDir, Iom, TempDir) {
    let a = Node::new(quick("a"));
    let b = Node::new(quick("b"));

    let b_addr = b.listen("127.0.0.1:0").await.unwrap();
    a.listen("127.0.0.1:0").await.unwrap();
    a.dial(b_addr).await.unwrap();
    sleep(Duration::from_millis(300)).await;

    let a_dir = TempDir::new().unwrap();
    let b_dir = TempDir::new().unwrap();

    let a_iom = Iom::with_timeout(a, a_dir.path(), Duration::from_secs(3)).unwrap();
    let b_iom = Iom::with_timeout(b, b_dir.path(), Duration::from_secs(3)).unwrap();

    (a_iom, a_dir, b_iom, b_dir)
}

fn quick(name: &str) -> Config {
    Config::new(name)
        .with_msa_period(Duration::from_millis(200))
        .with_timeout(Duration::from_secs(3))
}

fn pattern_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn fetch_spans_multiple_parts() {
    let (a_iom, a_dir, b_iom, _b_dir) = spawn_pair().await;

    // 25 MiB seeded on a: three parts, the last one short
    let len = 25 * 1024 * 1024usize;
    assert_eq!((len as u64).div_ceil(PART_SIZE), 3);

    let content = pattern_bytes(len);
    std::fs::write(a_dir.path().join("blob"), &content).unwrap();

    b_iom.get("blob").await.unwrap();

    let fetched = std::fs::read(b_iom.base().join("blob")).unwrap();
    assert_eq!(fetched.len(), len);
    assert_eq!(fetched, content);

    // scratch directories are gone
    assert!(b_iom.status().is_empty());
    let leftovers: Vec<_> = std::fs::read_dir(b_iom.base())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("transfer_"))
        .collect();
    assert!(leftovers.is_empty());

    let _ = a_iom;
}

#[tokio::test]
async fn get_is_idempotent_when_local() {
    let (a_iom, a_dir, _b_iom, _b_dir) = spawn_pair().await;

    std::fs::write(a_dir.path().join("local"), b"already here").unwrap();

    // no transfer happens; the call returns against the local copy
    a_iom.get("local").await.unwrap();
    let content = std::fs::read(a_dir.path().join("local")).unwrap();
    assert_eq!(content, b"already here");
}

#[tokio::test]
async fn missing_files_are_not_found() {
    let (_a_iom, _a_dir, b_iom, _b_dir) = spawn_pair().await;

    let err = b_iom.get("no-such-file").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn directory_get_fetches_every_file() {
    let (a_iom, a_dir, b_iom, _b_dir) = spawn_pair().await;

    std::fs::create_dir_all(a_dir.path().join("images")).unwrap();
    std::fs::write(a_dir.path().join("images/one"), b"first").unwrap();
    std::fs::write(a_dir.path().join("images/two"), b"second").unwrap();

    b_iom.get("images").await.unwrap();

    assert_eq!(
        std::fs::read(b_iom.base().join("images/one")).unwrap(),
        b"first"
    );
    assert_eq!(
        std::fs::read(b_iom.base().join("images/two")).unwrap(),
        b"second"
    );

    let _ = a_iom;
}

#[tokio::test]
async fn glob_get_fetches_matches_only() {
    let (a_iom, a_dir, b_iom, _b_dir) = spawn_pair().await;

    std::fs::write(a_dir.path().join("one.img"), b"image one").unwrap();
    std::fs::write(a_dir.path().join("two.img"), b"image two").unwrap();
    std::fs::write(a_dir.path().join("notes.txt"), b"skip me").unwrap();

    b_iom.get("*.img").await.unwrap();

    assert!(b_iom.base().join("one.img").exists());
    assert!(b_iom.base().join("two.img").exists());
    assert!(!b_iom.base().join("notes.txt").exists());

    let _ = a_iom;
}

#[tokio::test]
async fn escaping_names_are_rejected() {
    let (a_iom, _a_dir, _b_iom, _b_dir) = spawn_pair().await;

    assert!(matches!(
        a_iom.get("../outside").await.unwrap_err(),
        Error::BadPath(_)
    ));
}
