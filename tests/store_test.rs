//! Unit Tests for the Document Store
//!
//! Blob round-trips, joinCode aliasing, member uniqueness and online
//! counting, and purge, against the SQLite backend.

#[cfg(test)]
mod store_tests {
    use chrono::Utc;
    use kyro_hub::admission::Role;
    use kyro_hub::store::sqlite::SqliteStore;
    use kyro_hub::store::*;

    fn seed(room_key: &str, join_code: &str) -> RoomSeed {
        RoomSeed {
            room_key: room_key.to_string(),
            join_code: join_code.to_string(),
            name: "Test Room".to_string(),
            owner_ref: "user:owner-1".to_string(),
            visibility: Visibility::Public,
            password_hash: None,
            capacity: 10,
            language: "rust".to_string(),
        }
    }

    fn member(room_key: &str, principal_id: &str, role: Role, online: bool) -> MemberRecord {
        MemberRecord {
            room_key: room_key.to_string(),
            principal_id: principal_id.to_string(),
            display_name: principal_id.to_string(),
            role,
            joined_at: Utc::now(),
            last_seen: Utc::now(),
            online,
            banned: false,
        }
    }

    // ============= Room Rows =============

    mod room_rows {
        use super::*;

        #[tokio::test]
        async fn test_save_load_round_trips_blob_byte_for_byte() {
            let store = SqliteStore::open_in_memory().unwrap();
            store.create_room(seed("ROOM01", "JOIN0001")).await.unwrap();

            let blob: Vec<u8> = (0..=255).collect();
            store
                .save_room(SaveRequest {
                    room_key: "ROOM01".to_string(),
                    document_blob: blob.clone(),
                    fallback_text: "hello".to_string(),
                    language: "rust".to_string(),
                    reason: SaveReason::Debounce,
                    timestamp: Utc::now(),
                })
                .await
                .unwrap();

            let loaded = store.load_room("ROOM01").await.unwrap();
            assert_eq!(loaded.document_blob.as_deref(), Some(blob.as_slice()));
            assert_eq!(loaded.fallback_text, "hello");
            assert_eq!(loaded.last_save_reason, Some(SaveReason::Debounce));
            assert!(loaded.last_saved.is_some());
        }

        #[tokio::test]
        async fn test_join_code_addresses_the_same_room() {
            let store = SqliteStore::open_in_memory().unwrap();
            store.create_room(seed("ROOM01", "JOIN0001")).await.unwrap();
            let by_key = store.lookup_room("ROOM01").await.unwrap();
            let by_code = store.lookup_room("JOIN0001").await.unwrap();
            assert_eq!(by_key.room_key, by_code.room_key);
        }

        #[tokio::test]
        async fn test_duplicate_room_key_is_rejected() {
            let store = SqliteStore::open_in_memory().unwrap();
            store.create_room(seed("ROOM01", "JOIN0001")).await.unwrap();
            let result = store.create_room(seed("ROOM01", "JOIN0002")).await;
            assert!(matches!(result, Err(StoreError::RoomExists)));
        }

        #[tokio::test]
        async fn test_duplicate_join_code_is_rejected() {
            let store = SqliteStore::open_in_memory().unwrap();
            store.create_room(seed("ROOM01", "JOIN0001")).await.unwrap();
            let result = store.create_room(seed("ROOM02", "JOIN0001")).await;
            assert!(matches!(result, Err(StoreError::RoomExists)));
        }

        #[tokio::test]
        async fn test_missing_room_is_a_distinct_error() {
            let store = SqliteStore::open_in_memory().unwrap();
            let load = store.load_room("NOPE").await;
            assert!(matches!(load, Err(StoreError::RoomNotFound)));
            let save = store
                .save_room(SaveRequest {
                    room_key: "NOPE".to_string(),
                    document_blob: Vec::new(),
                    fallback_text: String::new(),
                    language: "rust".to_string(),
                    reason: SaveReason::Cleanup,
                    timestamp: Utc::now(),
                })
                .await;
            assert!(matches!(save, Err(StoreError::RoomNotFound)));
        }

        #[tokio::test]
        async fn test_settings_patch_updates_only_named_fields() {
            let store = SqliteStore::open_in_memory().unwrap();
            store.create_room(seed("ROOM01", "JOIN0001")).await.unwrap();
            store
                .update_settings(
                    "ROOM01",
                    SettingsPatch {
                        capacity: Some(3),
                        password_hash: Some(Some("hash".to_string())),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            let room = store.load_room("ROOM01").await.unwrap();
            assert_eq!(room.capacity, 3);
            assert_eq!(room.password_hash.as_deref(), Some("hash"));
            assert_eq!(room.name, "Test Room");
        }

        #[tokio::test]
        async fn test_rows_survive_reopen() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("hub.db");
            {
                let store = SqliteStore::open(&path).unwrap();
                store.create_room(seed("ROOM01", "JOIN0001")).await.unwrap();
                store
                    .save_room(SaveRequest {
                        room_key: "ROOM01".to_string(),
                        document_blob: vec![1, 2, 3],
                        fallback_text: "abc".to_string(),
                        language: "rust".to_string(),
                        reason: SaveReason::LastLeft,
                        timestamp: Utc::now(),
                    })
                    .await
                    .unwrap();
            }
            let store = SqliteStore::open(&path).unwrap();
            let room = store.load_room("ROOM01").await.unwrap();
            assert_eq!(room.document_blob, Some(vec![1, 2, 3]));
            assert_eq!(room.last_save_reason, Some(SaveReason::LastLeft));
        }
    }

    // ============= Member Rows =============

    mod member_rows {
        use super::*;

        #[tokio::test]
        async fn test_upsert_keeps_one_row_per_principal() {
            let store = SqliteStore::open_in_memory().unwrap();
            store.create_room(seed("ROOM01", "JOIN0001")).await.unwrap();
            store.upsert_member(member("ROOM01", "user-1", Role::Editor, true)).await.unwrap();
            store.upsert_member(member("ROOM01", "user-1", Role::Editor, true)).await.unwrap();
            assert_eq!(store.count_online("ROOM01").await.unwrap(), 1);
        }

        #[tokio::test]
        async fn test_upsert_preserves_existing_role() {
            let store = SqliteStore::open_in_memory().unwrap();
            store.create_room(seed("ROOM01", "JOIN0001")).await.unwrap();
            store.upsert_member(member("ROOM01", "user-1", Role::Owner, false)).await.unwrap();
            // a later join must not demote the owner row
            store.upsert_member(member("ROOM01", "user-1", Role::Editor, true)).await.unwrap();
            let row = store.get_member("ROOM01", "user-1").await.unwrap().unwrap();
            assert_eq!(row.role, Role::Owner);
            assert!(row.online);
        }

        #[tokio::test]
        async fn test_online_counting_follows_marks() {
            let store = SqliteStore::open_in_memory().unwrap();
            store.create_room(seed("ROOM01", "JOIN0001")).await.unwrap();
            store.upsert_member(member("ROOM01", "user-1", Role::Editor, true)).await.unwrap();
            store.upsert_member(member("ROOM01", "user-2", Role::Editor, true)).await.unwrap();
            assert_eq!(store.count_online("ROOM01").await.unwrap(), 2);
            store.mark_online("ROOM01", "user-1", false).await.unwrap();
            assert_eq!(store.count_online("ROOM01").await.unwrap(), 1);
        }

        #[tokio::test]
        async fn test_purge_removes_room_and_members() {
            let store = SqliteStore::open_in_memory().unwrap();
            store.create_room(seed("ROOM01", "JOIN0001")).await.unwrap();
            store.upsert_member(member("ROOM01", "user-1", Role::Editor, true)).await.unwrap();
            store.purge_room("ROOM01").await.unwrap();
            assert!(matches!(store.load_room("ROOM01").await, Err(StoreError::RoomNotFound)));
            assert!(store.get_member("ROOM01", "user-1").await.unwrap().is_none());
            assert_eq!(store.count_online("ROOM01").await.unwrap(), 0);
        }
    }
}
