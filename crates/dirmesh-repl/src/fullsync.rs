//! Full update: transferring a complete data set to a replica whose
//! generation id no longer matches the topology.
//!
//! A session is strictly one-directional: the source streams a start frame,
//! every entry with its history ledger, and a done frame carrying the count
//! actually sent. Both sides close the link when the session ends, success
//! or not; the target reconnects afterwards and handshakes with the new
//! generation id.

use crate::error::ReplError;
use crate::history::EntryHistory;
use crate::link::RelayLink;
use crate::stamp::ReplicaId;
use crate::wire::WireMessage;

/// A complete data set received through a full update session.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedDataSet {
    /// The replica that provided the data.
    pub source: ReplicaId,
    /// Generation id the target must adopt.
    pub generation_id: u64,
    /// Every entry with its decoded history ledger.
    pub entries: Vec<(String, EntryHistory)>,
}

/// Stream the given entries to the peer, then close the link.
///
/// `entries` pairs each entry key with its encoded history ledger. The
/// returned count is the number of entries sent.
pub async fn send_full_update(
    link: &RelayLink,
    source: ReplicaId,
    generation_id: u64,
    entries: Vec<(String, Vec<u8>)>,
) -> Result<u64, ReplError> {
    let total = entries.len() as u64;
    tracing::info!(source, generation_id, total, "starting full update");

    let result = async {
        link.send(&WireMessage::FullUpdateStart {
            source,
            generation_id,
            total_entries: total,
        })
        .await?;
        let mut sent = 0u64;
        for (entry_key, history) in entries {
            link.send(&WireMessage::FullUpdateEntry { entry_key, history })
                .await?;
            sent += 1;
        }
        link.send(&WireMessage::FullUpdateDone { entries_sent: sent })
            .await?;
        Ok(sent)
    }
    .await;

    // The session always ends with the link going down.
    link.close().await;
    result
}

/// Receive a full update session from the peer, starting at the frame after
/// the already-consumed [`WireMessage::FullUpdateStart`], then close the
/// link.
pub async fn receive_full_update(
    link: &RelayLink,
    source: ReplicaId,
    generation_id: u64,
    total_entries: u64,
) -> Result<ReceivedDataSet, ReplError> {
    let result = receive_entries(link, source, generation_id, total_entries).await;
    link.close().await;
    match &result {
        Ok(data) => {
            tracing::info!(
                source,
                generation_id,
                entries = data.entries.len(),
                "full update complete"
            );
        }
        Err(e) => {
            tracing::warn!(source, error = %e, "full update failed");
        }
    }
    result
}

async fn receive_entries(
    link: &RelayLink,
    source: ReplicaId,
    generation_id: u64,
    total_entries: u64,
) -> Result<ReceivedDataSet, ReplError> {
    let mut entries = Vec::with_capacity(total_entries.min(1 << 20) as usize);
    loop {
        match link.recv().await? {
            Some(WireMessage::FullUpdateEntry { entry_key, history }) => {
                let history = EntryHistory::decode(&history)?;
                entries.push((entry_key, history));
            }
            Some(WireMessage::FullUpdateDone { entries_sent }) => {
                if entries_sent != entries.len() as u64 {
                    return Err(ReplError::Link {
                        msg: format!(
                            "full update lost entries: peer sent {entries_sent}, received {}",
                            entries.len()
                        ),
                    });
                }
                return Ok(ReceivedDataSet {
                    source,
                    generation_id,
                    entries,
                });
            }
            Some(other) => {
                return Err(ReplError::Link {
                    msg: format!("unexpected message during full update: {other:?}"),
                });
            }
            None => {
                return Err(ReplError::Link {
                    msg: "link dropped mid full update".to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{LinkConfig, LinkState};
    use crate::stamp::ChangeStamp;

    fn history_with_value(wall_ms: u64) -> EntryHistory {
        let mut h = EntryHistory::new();
        h.multi_mut("cn")
            .record_add(b"value", ChangeStamp::new(wall_ms, 0, 1));
        h
    }

    async fn expect_start(link: &RelayLink) -> (ReplicaId, u64, u64) {
        match link.recv().await.unwrap() {
            Some(WireMessage::FullUpdateStart {
                source,
                generation_id,
                total_entries,
            }) => (source, generation_id, total_entries),
            other => panic!("expected start frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_round_trip_session() {
        let (source_end, target_end) = RelayLink::new_pair(LinkConfig::new(1, 2), LinkConfig::new(2, 1));

        let entries: Vec<(String, Vec<u8>)> = (0..5)
            .map(|i| {
                (
                    format!("entry-{i}"),
                    history_with_value(1000 + i).encode().unwrap(),
                )
            })
            .collect();

        let sender = tokio::spawn(async move {
            send_full_update(&source_end, 1, 42, entries).await
        });

        let (source, generation_id, total) = expect_start(&target_end).await;
        assert_eq!((source, generation_id, total), (1, 42, 5));

        let data = receive_full_update(&target_end, source, generation_id, total)
            .await
            .unwrap();
        assert_eq!(sender.await.unwrap().unwrap(), 5);
        assert_eq!(data.generation_id, 42);
        assert_eq!(data.entries.len(), 5);
        assert_eq!(data.entries[0].0, "entry-0");
        assert_eq!(data.entries[0].1, history_with_value(1000));
    }

    #[tokio::test]
    async fn test_empty_data_set() {
        let (source_end, target_end) = RelayLink::new_pair(LinkConfig::new(1, 2), LinkConfig::new(2, 1));

        let sender =
            tokio::spawn(async move { send_full_update(&source_end, 1, 9, vec![]).await });

        let (source, generation_id, total) = expect_start(&target_end).await;
        let data = receive_full_update(&target_end, source, generation_id, total)
            .await
            .unwrap();
        assert_eq!(sender.await.unwrap().unwrap(), 0);
        assert!(data.entries.is_empty());
    }

    #[tokio::test]
    async fn test_link_closed_after_session() {
        let (source_end, target_end) = RelayLink::new_pair(LinkConfig::new(1, 2), LinkConfig::new(2, 1));

        let source_clone = source_end.clone();
        let sender =
            tokio::spawn(async move { send_full_update(&source_clone, 1, 9, vec![]).await });

        let (source, generation_id, total) = expect_start(&target_end).await;
        receive_full_update(&target_end, source, generation_id, total)
            .await
            .unwrap();
        sender.await.unwrap().unwrap();

        assert_eq!(source_end.state().await, LinkState::Closed);
        assert_eq!(target_end.state().await, LinkState::Closed);
    }

    #[tokio::test]
    async fn test_dropped_link_mid_session_fails() {
        let (source_end, target_end) = RelayLink::new_pair(LinkConfig::new(1, 2), LinkConfig::new(2, 1));

        source_end
            .send(&WireMessage::FullUpdateStart {
                source: 1,
                generation_id: 3,
                total_entries: 10,
            })
            .await
            .unwrap();
        source_end
            .send(&WireMessage::FullUpdateEntry {
                entry_key: "only-one".to_string(),
                history: history_with_value(1).encode().unwrap(),
            })
            .await
            .unwrap();
        drop(source_end);

        let (source, generation_id, total) = expect_start(&target_end).await;
        let err = receive_full_update(&target_end, source, generation_id, total)
            .await
            .unwrap_err();
        assert!(matches!(err, ReplError::Link { .. }));
        assert_eq!(target_end.state().await, LinkState::Closed);
    }

    #[tokio::test]
    async fn test_count_mismatch_fails() {
        let (source_end, target_end) = RelayLink::new_pair(LinkConfig::new(1, 2), LinkConfig::new(2, 1));

        source_end
            .send(&WireMessage::FullUpdateStart {
                source: 1,
                generation_id: 3,
                total_entries: 2,
            })
            .await
            .unwrap();
        source_end
            .send(&WireMessage::FullUpdateDone { entries_sent: 2 })
            .await
            .unwrap();

        let (source, generation_id, total) = expect_start(&target_end).await;
        let err = receive_full_update(&target_end, source, generation_id, total)
            .await
            .unwrap_err();
        assert!(matches!(err, ReplError::Link { .. }));
    }

    #[tokio::test]
    async fn test_malformed_history_fails() {
        let (source_end, target_end) = RelayLink::new_pair(LinkConfig::new(1, 2), LinkConfig::new(2, 1));

        source_end
            .send(&WireMessage::FullUpdateStart {
                source: 1,
                generation_id: 3,
                total_entries: 1,
            })
            .await
            .unwrap();
        source_end
            .send(&WireMessage::FullUpdateEntry {
                entry_key: "bad".to_string(),
                history: vec![0xFF, 0xFF],
            })
            .await
            .unwrap();

        let (source, generation_id, total) = expect_start(&target_end).await;
        let err = receive_full_update(&target_end, source, generation_id, total)
            .await
            .unwrap_err();
        assert!(matches!(err, ReplError::MalformedHistory { .. }));
    }
}
