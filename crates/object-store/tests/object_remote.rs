//! ObjectRemote against the in-memory and local object_store backends

use std::sync::Arc;

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::ObjectStore;

use common::remote::{EntryKind, FolderChange, RemoteError, RemoteStore};
use common::{FsConfig, RemoteFs};
use remotefs_object_store::{ObjectRemote, ObjectStoreConfig, FOLDER_MARKER};

const QUOTA: u64 = 10 * 1024 * 1024;

fn remote() -> ObjectRemote {
    ObjectRemote::new(Arc::new(InMemory::new()), QUOTA)
}

async fn put(remote: &ObjectRemote, path: &str, data: &'static [u8]) {
    let session = remote
        .start_upload_session(Bytes::from_static(data))
        .await
        .unwrap();
    remote
        .commit_upload_session(path, &session, data.len() as u64)
        .await
        .unwrap();
}

async fn read_all(remote: &ObjectRemote, path: &str, offset: u64) -> Vec<u8> {
    let chunks: Vec<Bytes> = remote
        .download(path, offset)
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    chunks.concat()
}

fn listing(change: FolderChange) -> common::FolderListing {
    match change {
        FolderChange::Changed(listing) => listing,
        FolderChange::Unchanged => panic!("expected a listing"),
    }
}

#[tokio::test]
async fn test_upload_session_round_trip() {
    let remote = remote();

    let session = remote
        .start_upload_session(Bytes::from_static(b"hello "))
        .await
        .unwrap();
    remote
        .append_upload_session(&session, 6, Bytes::from_static(b"world"))
        .await
        .unwrap();
    let metadata = remote
        .commit_upload_session("/greeting.txt", &session, 11)
        .await
        .unwrap();

    assert_eq!(metadata.kind, EntryKind::File);
    assert_eq!(metadata.path, "/greeting.txt");
    assert_eq!(metadata.size, 11);
    assert!(metadata.modified.is_some());
    assert_eq!(read_all(&remote, "/greeting.txt", 0).await, b"hello world");
    assert_eq!(read_all(&remote, "/greeting.txt", 6).await, b"world");
    assert!(read_all(&remote, "/greeting.txt", 11).await.is_empty());
}

#[tokio::test]
async fn test_session_cursor_is_checked() {
    let remote = remote();
    let session = remote
        .start_upload_session(Bytes::from_static(b"abc"))
        .await
        .unwrap();

    let err = remote
        .append_upload_session(&session, 10, Bytes::from_static(b"d"))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        RemoteError::InvalidCursor {
            expected: 3,
            actual: 10
        }
    );

    let err = remote
        .commit_upload_session("/x", &session, 4)
        .await
        .unwrap_err();
    assert!(matches!(err, RemoteError::InvalidCursor { .. }));
}

#[tokio::test]
async fn test_empty_session_commits_empty_object() {
    let remote = remote();
    let session = remote.start_upload_session(Bytes::new()).await.unwrap();
    let metadata = remote
        .commit_upload_session("/empty", &session, 0)
        .await
        .unwrap();

    assert_eq!(metadata.size, 0);
    assert_eq!(remote.get_metadata("/empty").await.unwrap().size, 0);
}

#[tokio::test]
async fn test_unknown_session() {
    let remote = remote();
    let bogus = common::SessionId::new("nope");
    let err = remote
        .append_upload_session(&bogus, 0, Bytes::from_static(b"x"))
        .await
        .unwrap_err();
    assert!(matches!(err, RemoteError::UnknownSession(_)));
}

#[tokio::test]
async fn test_folders_and_listing() {
    let remote = remote();
    remote.create_folder("/empty").await.unwrap();
    put(&remote, "/docs/a.txt", b"a").await;
    put(&remote, "/top.txt", b"top").await;

    let root = listing(remote.list_folder("/", None).await.unwrap());
    let paths: Vec<_> = root.entries.iter().map(|e| e.path.as_str()).collect();
    assert_eq!(paths, vec!["/docs", "/empty", "/top.txt"]);
    assert!(root.entries[0].is_folder());
    assert!(root.entries[1].is_folder());

    let empty = listing(remote.list_folder("/empty", None).await.unwrap());
    assert!(empty.entries.is_empty(), "folder marker must stay hidden");

    assert!(matches!(
        remote.list_folder("/top.txt", None).await,
        Err(RemoteError::NotFolder(_))
    ));
    assert!(matches!(
        remote.list_folder("/missing", None).await,
        Err(RemoteError::NotFound(_))
    ));
    assert!(remote.create_folder("/docs").await.is_err());
}

#[tokio::test]
async fn test_unchanged_listing_revision() {
    let remote = remote();
    put(&remote, "/dir/a", b"1").await;

    let first = listing(remote.list_folder("/dir", None).await.unwrap());
    let again = remote
        .list_folder("/dir", Some(&first.revision))
        .await
        .unwrap();
    assert_eq!(again, FolderChange::Unchanged);

    put(&remote, "/dir/b", b"2").await;
    let changed = listing(
        remote
            .list_folder("/dir", Some(&first.revision))
            .await
            .unwrap(),
    );
    assert_ne!(changed.revision, first.revision);
    assert_eq!(changed.entries.len(), 2);
}

#[tokio::test]
async fn test_metadata_for_files_and_folders() {
    let remote = remote();
    put(&remote, "/dir/file", b"12345").await;

    let file = remote.get_metadata("/dir/file").await.unwrap();
    assert_eq!(file.size, 5);
    assert!(file.revision.is_some());

    let folder = remote.get_metadata("/dir").await.unwrap();
    assert!(folder.is_folder());
    assert!(remote.get_metadata("/").await.unwrap().is_folder());
    assert!(remote.get_metadata("/nope").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_move_and_delete() {
    let remote = remote();
    put(&remote, "/src/one", b"1").await;
    put(&remote, "/src/sub/two", b"22").await;
    remote.create_folder("/src/empty").await.unwrap();

    remote.move_path("/src", "/dst").await.unwrap();
    assert!(remote.get_metadata("/src").await.is_err());
    assert_eq!(read_all(&remote, "/dst/sub/two", 0).await, b"22");
    assert!(remote.get_metadata("/dst/empty").await.unwrap().is_folder());

    remote.move_path("/dst/one", "/moved").await.unwrap();
    assert_eq!(read_all(&remote, "/moved", 0).await, b"1");

    remote.delete("/dst").await.unwrap();
    assert!(remote.get_metadata("/dst/sub/two").await.is_err());
    remote.delete("/moved").await.unwrap();
    assert!(matches!(
        remote.delete("/moved").await,
        Err(RemoteError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_space_usage() {
    let remote = remote();
    put(&remote, "/a", b"12345").await;
    put(&remote, "/b", b"123").await;

    let usage = remote.space_usage().await.unwrap();
    assert_eq!(usage.used, 8);
    assert_eq!(usage.allocated, QUOTA);
}

#[tokio::test]
async fn test_staging_area_is_cleaned_up() {
    let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    let remote = ObjectRemote::new(store.clone(), QUOTA);
    put(&remote, "/f", b"data").await;

    let leftovers: Vec<_> = store
        .list(Some(&Path::from(remotefs_object_store::STAGING_PREFIX)))
        .try_collect()
        .await
        .unwrap();
    assert!(leftovers.is_empty());

    remote.create_folder("/d").await.unwrap();
    let marker = Path::from(format!("d/{}", FOLDER_MARKER));
    assert!(store.head(&marker).await.is_ok());
}

#[tokio::test]
async fn test_failed_commit_removes_staged_upload() {
    let temp = tempfile::tempdir().unwrap();
    let config = ObjectStoreConfig::Local {
        path: temp.path().join("objects"),
    };
    let remote = ObjectRemote::from_config(&config, QUOTA).unwrap();
    // A non-empty folder cannot be replaced by a file
    remote.create_folder("/taken").await.unwrap();

    let session = remote
        .start_upload_session(Bytes::from_static(b"data"))
        .await
        .unwrap();
    let err = remote
        .commit_upload_session("/taken", &session, 4)
        .await
        .unwrap_err();
    assert!(matches!(err, RemoteError::Transport(_)));

    let leftovers: Vec<_> = remote
        .store()
        .list(Some(&Path::from(remotefs_object_store::STAGING_PREFIX)))
        .try_collect()
        .await
        .unwrap();
    assert!(leftovers.is_empty());
    assert!(matches!(
        remote.commit_upload_session("/taken", &session, 4).await,
        Err(RemoteError::UnknownSession(_))
    ));
    assert_eq!(
        remote.get_metadata("/taken").await.unwrap().kind,
        EntryKind::Folder
    );
}

#[tokio::test]
async fn test_local_backend() {
    let temp = tempfile::tempdir().unwrap();
    let config = ObjectStoreConfig::Local {
        path: temp.path().join("objects"),
    };
    let remote = ObjectRemote::from_config(&config, QUOTA).unwrap();

    put(&remote, "/notes/today.md", b"# today").await;
    remote.create_folder("/archive").await.unwrap();

    let root = listing(remote.list_folder("/", None).await.unwrap());
    let paths: Vec<_> = root.entries.iter().map(|e| e.path.as_str()).collect();
    assert_eq!(paths, vec!["/archive", "/notes"]);
    assert_eq!(read_all(&remote, "/notes/today.md", 2).await, b"today");
}

#[tokio::test]
async fn test_filesystem_over_object_store() {
    let remote = Arc::new(remote());
    let fs = RemoteFs::new(remote.clone(), FsConfig::default()).unwrap();

    fs.create_folder("/projects").await.unwrap();
    let fh = fs.create("/projects/plan.txt").await.unwrap();
    fs.write(fh, b"step one\n", 0).await.unwrap();
    fs.write(fh, b"step two\n", 9).await.unwrap();
    fs.release(fh).await.unwrap();

    assert_eq!(fs.list("/projects").await.unwrap(), vec![".", "..", "plan.txt"]);
    assert_eq!(fs.attributes("/projects/plan.txt").await.unwrap().size, 18);

    let fh = fs.open("/projects/plan.txt", libc::O_RDONLY).await.unwrap();
    assert_eq!(&fs.read(fh, 8, 9).await.unwrap()[..], b"step two");
    fs.release(fh).await.unwrap();

    fs.rename("/projects/plan.txt", "/plan.txt").await.unwrap();
    fs.delete_folder("/projects").await.unwrap();
    assert_eq!(fs.list("/").await.unwrap(), vec![".", "..", "plan.txt"]);
}
