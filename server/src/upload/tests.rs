use super::*;

use bytes::Bytes;

use crate::attachment::get_attachment;
use crate::pool::{create_pool, NewPool};
use crate::testing;

fn fragment_request(size: u64, fingerprint: Option<&str>) -> NewFragment {
    NewFragment {
        file: NewAttachment::new("default", "video.mp4"),
        size,
        fingerprint: fingerprint.map(str::to_owned),
    }
}

#[test]
fn test_allocate_chunks() {
    let chunks = allocate_chunks(10_000_000, 4_000_000);
    assert_eq!(3, chunks.len());

    let mut ordinals: Vec<i32> = chunks.values().copied().collect();
    ordinals.sort();
    assert_eq!(vec![0, 1, 2], ordinals);

    assert_eq!(1, allocate_chunks(1, 4_000_000).len());
    assert_eq!(1, allocate_chunks(4_000_000, 4_000_000).len());
    assert_eq!(2, allocate_chunks(4_000_001, 4_000_000).len());
}

#[test]
fn test_infer_mime_type() {
    assert_eq!("image/png", infer_mime_type(None, "cat.png"));
    assert_eq!("text/plain", infer_mime_type(Some("text/plain"), "cat.png"));
    assert_eq!("image/jpeg", infer_mime_type(Some(""), "cat.jpg"));
    assert_eq!(FALLBACK_MIME_TYPE, infer_mime_type(None, "no-extension"));
}

#[tokio::test]
async fn test_direct_upload() {
    let env = testing::setup().await;

    let attachment = testing::upload(&env.state, "hello.txt", b"hello world").await;

    assert!(attachment.is_uploaded);
    assert!(attachment.is_temporary());
    assert!(!attachment.is_analyzed);
    assert_eq!(11, attachment.size);
    assert_eq!("text/plain", attachment.mime_type);
    assert_eq!(Some(env.pool.id), attachment.pool_id);
    assert_eq!(
        Some(Hash::sha256_from_bytes(b"hello world").to_typed_base16()),
        attachment.hash
    );
    assert!(testing::object_exists(&env.state, TEMPORARY_DESTINATION, &attachment.uuid).await);

    // Queued for analysis
    assert_eq!(1, env.state.analysis_queue.len());
}

#[tokio::test]
async fn test_direct_upload_size_mismatch() {
    let env = testing::setup().await;

    let mut stream: &[u8] = b"short";
    let result = create_attachment_direct(
        &env.state,
        &testing::ACTOR,
        NewAttachment::new("default", "a.txt"),
        100,
        &mut stream,
    )
    .await;
    assert!(matches!(result, Err(ServerError::RequestError(_))));

    // The record is rolled back
    let db = env.state.database().await.unwrap();
    testing::wait_for(|| async {
        let count = Attachment::find().count(db).await.unwrap();
        (count == 0).then_some(())
    })
    .await;
}

#[tokio::test]
async fn test_size_limits() {
    let env = testing::setup().await;

    let mut new = NewPool::new("small".parse().unwrap());
    new.max_file_size = Some(4);
    create_pool(&env.state, new).await.unwrap();

    let mut stream: &[u8] = b"too large";
    let result = create_attachment_direct(
        &env.state,
        &testing::ACTOR,
        NewAttachment::new("small", "a.txt"),
        9,
        &mut stream,
    )
    .await;
    assert!(matches!(
        result,
        Err(ServerError::PoolSizeExceeded { size: 9, limit: 4 })
    ));

    let mut request = fragment_request(9, None);
    request.file.pool = "small".to_string();
    assert!(matches!(
        create_fragment(&env.state, &testing::ACTOR, request).await,
        Err(ServerError::PoolSizeExceeded { .. })
    ));

    let limited = Actor {
        account_id: 1,
        max_upload_size: Some(2),
    };
    assert!(matches!(
        create_fragment(&env.state, &limited, fragment_request(3, None)).await,
        Err(ServerError::QuotaExceeded { size: 3, limit: 2 })
    ));

    assert!(matches!(
        create_fragment(&env.state, &testing::ACTOR, fragment_request(0, None)).await,
        Err(ServerError::RequestError(_))
    ));

    let mut request = fragment_request(3, None);
    request.file.pool = "nowhere".to_string();
    assert!(matches!(
        create_fragment(&env.state, &testing::ACTOR, request).await,
        Err(ServerError::NoSuchPool)
    ));
}

#[tokio::test]
async fn test_chunked_resume() {
    let env = testing::setup_with_chunk_size(4_000_000).await;
    let state = &env.state;

    let mut request = fragment_request(10_000_000, Some("fp"));
    request.file.is_indexable = true;

    let fragment = create_fragment(state, &testing::ACTOR, request).await.unwrap();
    let chunks = fragment.ordered_chunk_ids();
    assert_eq!(3, chunks.len());
    assert!(fragment.is_indexable);
    assert_eq!(FragmentState::Placeholder, fragment_state(state, &fragment).await.unwrap());

    // Same fingerprint resumes the fragment
    let resumed = create_fragment(state, &testing::ACTOR, fragment_request(10_000_000, Some("fp")))
        .await
        .unwrap();
    assert_eq!(fragment.rid, resumed.rid);

    let contents: Vec<Bytes> = vec![
        vec![b'a'; 4_000_000].into(),
        vec![b'b'; 4_000_000].into(),
        vec![b'c'; 2_000_000].into(),
    ];

    let result = upload_chunk(state, &testing::ACTOR, &fragment.rid, &chunks[2], contents[2].clone())
        .await
        .unwrap();
    assert!(matches!(result, ChunkUploadResult::Partial { ref missing, .. } if missing.len() == 2));

    let result = upload_chunk(state, &testing::ACTOR, &fragment.rid, &chunks[0], contents[0].clone())
        .await
        .unwrap();
    match result {
        ChunkUploadResult::Partial { missing, .. } => assert_eq!(vec![chunks[1].clone()], missing),
        other => panic!("Expected a partial upload, got {:?}", other),
    }
    assert_eq!(
        FragmentState::Partial {
            missing: vec![chunks[1].clone()]
        },
        fragment_state(state, &fragment).await.unwrap()
    );

    let result = upload_chunk(state, &testing::ACTOR, &fragment.rid, &chunks[1], contents[1].clone())
        .await
        .unwrap();
    let attachment = match result {
        ChunkUploadResult::Merged(attachment) => attachment,
        other => panic!("Expected a merged upload, got {:?}", other),
    };

    assert!(attachment.is_uploaded);
    assert!(attachment.is_temporary());
    assert_eq!(fragment.rid, attachment.rid);
    assert_eq!(10_000_000, attachment.size);
    assert!(attachment.is_indexable);

    let expected: Vec<u8> = contents.iter().flat_map(|c| c.iter().copied()).collect();
    assert_eq!(
        Some(Hash::sha256_from_bytes(&expected).to_typed_base16()),
        attachment.hash
    );

    let destinations = state.destinations().await.unwrap();
    let merged = read_object(destinations.temporary().backend.as_ref(), attachment.uuid.clone())
        .await
        .unwrap();
    assert_eq!(expected.as_slice(), merged.as_ref());

    // Chunks are gone, and so is the fragment
    for chunk_id in chunks.iter() {
        assert!(
            !testing::object_exists(state, TEMPORARY_DESTINATION, &chunk_object_name(&fragment.uuid, chunk_id))
                .await
        );
    }
    assert!(matches!(
        get_fragment(state, &fragment.rid).await,
        Err(ServerError::NoSuchFragment)
    ));
    assert_eq!(attachment.id, get_attachment(state, &attachment.rid).await.unwrap().id);
}

#[tokio::test]
async fn test_chunk_errors() {
    let env = testing::setup().await;
    let state = &env.state;

    // Chunk size is 4 bytes, so this makes 3 chunks
    let fragment = create_fragment(state, &testing::ACTOR, fragment_request(10, None))
        .await
        .unwrap();
    let chunks = fragment.ordered_chunk_ids();

    assert!(matches!(
        upload_chunk(state, &testing::ACTOR, &fragment.rid, "nonexist", Bytes::from_static(b"abcd")).await,
        Err(ServerError::UnknownChunk { .. })
    ));

    assert!(matches!(
        upload_chunk(state, &testing::ACTOR, &fragment.rid, &chunks[0], Bytes::from_static(b"abcde")).await,
        Err(ServerError::ChunkTooLarge { size: 5, limit: 4 })
    ));

    assert!(matches!(
        upload_chunk(state, &Actor::new(2), &fragment.rid, &chunks[0], Bytes::from_static(b"abcd")).await,
        Err(ServerError::NotOwner)
    ));

    upload_chunk(state, &testing::ACTOR, &fragment.rid, &chunks[0], Bytes::from_static(b"abcd"))
        .await
        .unwrap();

    assert!(matches!(
        upload_chunk(state, &testing::ACTOR, &fragment.rid, &chunks[0], Bytes::from_static(b"abcd")).await,
        Err(ServerError::ChunkAlreadyUploaded { .. })
    ));

    // Merging refuses incomplete fragments
    assert!(matches!(
        merge_fragment(state, &fragment).await,
        Err(ServerError::FragmentIncomplete { missing: 2 })
    ));

    // The claim is released after the failed merge
    testing::wait_for(|| async {
        let db = state.database().await.unwrap();
        let current = db.find_fragment_by_rid(&fragment.rid).await.unwrap();
        (!current.is_merging).then_some(())
    })
    .await;
}

#[tokio::test]
async fn test_merge_claim() {
    let env = testing::setup().await;
    let state = &env.state;

    let fragment = create_fragment(state, &testing::ACTOR, fragment_request(4, None))
        .await
        .unwrap();
    let chunk_id = fragment.ordered_chunk_ids().remove(0);

    // Someone else is merging
    let db = state.database().await.unwrap();
    assert!(db.claim_fragment_merge(fragment.id).await.unwrap());
    assert_eq!(FragmentState::Merging, fragment_state(state, &fragment).await.unwrap());

    let result = upload_chunk(state, &testing::ACTOR, &fragment.rid, &chunk_id, Bytes::from_static(b"abcd"))
        .await
        .unwrap();
    assert!(matches!(result, ChunkUploadResult::Merging(_)));

    db.release_fragment_merge(fragment.id).await.unwrap();
    let attachment = merge_fragment(state, &fragment).await.unwrap();
    assert_eq!(4, attachment.size);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_chunk_writes() {
    let env = testing::setup().await;

    let fragment = create_fragment(&env.state, &testing::ACTOR, fragment_request(10, None))
        .await
        .unwrap();
    let chunk_id = fragment.ordered_chunk_ids().remove(0);

    let writers = [b"aaaa", b"bbbb"].map(|data| {
        let state = env.state.clone();
        let rid = fragment.rid.clone();
        let chunk_id = chunk_id.clone();
        tokio::spawn(async move {
            upload_chunk(&state, &testing::ACTOR, &rid, &chunk_id, Bytes::from_static(data)).await
        })
    });

    let mut written = 0;
    let mut rejected = 0;
    for result in futures::future::join_all(writers).await {
        match result.unwrap() {
            Ok(ChunkUploadResult::Partial { .. }) => written += 1,
            Err(ServerError::ChunkAlreadyUploaded { .. }) => rejected += 1,
            other => panic!("Unexpected result {:?}", other),
        }
    }
    assert_eq!((1, 1), (written, rejected));

    // Whichever write won is intact
    let destinations = env.state.destinations().await.unwrap();
    let stored = read_object(
        destinations.temporary().backend.as_ref(),
        chunk_object_name(&fragment.uuid, &chunk_id),
    )
    .await
    .unwrap();
    assert!(stored.as_ref() == b"aaaa" || stored.as_ref() == b"bbbb");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_last_chunks() {
    let env = testing::setup().await;
    let db = env.state.database().await.unwrap();

    for round in 0..5 {
        // Two chunks of 4 bytes, uploaded at the same time
        let fragment = create_fragment(&env.state, &testing::ACTOR, fragment_request(8, None))
            .await
            .unwrap();

        let uploads = fragment
            .ordered_chunk_ids()
            .into_iter()
            .zip([b"left", b"rght"])
            .map(|(chunk_id, data)| {
                let state = env.state.clone();
                let rid = fragment.rid.clone();
                tokio::spawn(async move {
                    upload_chunk(&state, &testing::ACTOR, &rid, &chunk_id, Bytes::from_static(data)).await
                })
            })
            .collect::<Vec<_>>();

        let mut merged = Vec::new();
        for result in futures::future::join_all(uploads).await {
            match result.unwrap() {
                Ok(ChunkUploadResult::Merged(attachment)) => merged.push(attachment),
                Ok(ChunkUploadResult::Merging(_)) | Ok(ChunkUploadResult::Partial { .. }) => {}
                Err(e) => panic!("Round {}: chunk upload failed: {}", round, e),
            }
        }

        assert_eq!(1, merged.len(), "round {}", round);
        let attachment = merged.remove(0);
        assert_eq!(fragment.rid, attachment.rid);
        assert_eq!(
            Some(Hash::sha256_from_bytes(b"leftrght").to_typed_base16()),
            attachment.hash
        );

        let rows = Attachment::find()
            .filter(attachment::Column::Rid.eq(fragment.rid.as_str()))
            .count(db)
            .await
            .unwrap();
        assert_eq!(1, rows);

        assert_eq!(
            0,
            Fragment::find()
                .filter(fragment::Column::Id.eq(fragment.id))
                .count(db)
                .await
                .unwrap()
        );
        assert!(matches!(
            get_fragment(&env.state, &fragment.rid).await,
            Err(ServerError::NoSuchFragment)
        ));
    }
}
