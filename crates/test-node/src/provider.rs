//! # Provider
//!
//! In-memory implementation of the provider traits for testing: message,
//! data (over an in-memory blockstore), event-log, and task stores, a
//! channel-based event stream, and offline `did:key` resolution.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use blockstore::{Blockstore as _, InMemoryBlockstore};
use dwn_core::data::{self, DataStream};
use dwn_core::event::{Event, SubscribeFilter, Subscriber};
use dwn_core::provider::{
    BlockStore, Cursor, DataStore, DidResolver, Document, Entry, EventLog, EventStream, KeyStore,
    Keyring, MessageStore, Provider, Query, ResumableTask, TaskStore, VerificationMethod,
};
use futures::channel::mpsc;

use crate::key_store;

/// An in-memory web node provider.
#[derive(Clone)]
pub struct ProviderImpl {
    messages: Arc<RwLock<HashMap<String, BTreeMap<String, Entry>>>>,
    blocks: Arc<InMemoryBlockstore<64>>,
    data_refs: Arc<RwLock<HashMap<String, HashMap<String, DataObject>>>>,
    events: Arc<RwLock<HashMap<String, Vec<(u64, Event)>>>>,
    watermark: Arc<AtomicU64>,
    tasks: Arc<RwLock<HashMap<String, BTreeMap<String, TaskLease>>>>,
    subscribers: Arc<RwLock<HashMap<String, Vec<Subscription>>>>,
}

// A stored data object: its size and the records referencing it.
#[derive(Clone, Debug)]
struct DataObject {
    size: usize,
    records: HashSet<String>,
}

// A registered task and its lease expiry.
#[derive(Clone)]
struct TaskLease {
    task: ResumableTask,
    expires_at: Instant,
}

// An open event-stream subscription.
struct Subscription {
    filter: SubscribeFilter,
    sender: mpsc::UnboundedSender<Event>,
}

impl Provider for ProviderImpl {}

impl ProviderImpl {
    /// Create a new, empty provider.
    ///
    /// # Errors
    ///
    /// Infallible; `Result` for signature stability with real providers.
    #[allow(clippy::unused_async)]
    pub async fn new() -> Result<Self> {
        Ok(Self {
            messages: Arc::new(RwLock::new(HashMap::new())),
            blocks: Arc::new(InMemoryBlockstore::new()),
            data_refs: Arc::new(RwLock::new(HashMap::new())),
            events: Arc::new(RwLock::new(HashMap::new())),
            watermark: Arc::new(AtomicU64::new(0)),
            tasks: Arc::new(RwLock::new(HashMap::new())),
            subscribers: Arc::new(RwLock::new(HashMap::new())),
        })
    }
}

impl MessageStore for ProviderImpl {
    async fn put(&self, owner: &str, entry: &Entry) -> Result<()> {
        let cid = entry.cid().map_err(|e| anyhow!(e))?;
        let mut messages = self.messages.write().expect("poisoned");
        messages.entry(owner.to_string()).or_default().insert(cid, entry.clone());
        Ok(())
    }

    async fn query(&self, owner: &str, query: &Query) -> Result<(Vec<Entry>, Option<Cursor>)> {
        let matches: Vec<Entry> = {
            let messages = self.messages.read().expect("poisoned");
            let Some(entries) = messages.get(owner) else {
                return Ok((Vec::new(), None));
            };
            entries.values().filter(|entry| query.is_match(entry)).cloned().collect()
        };

        // records queries sort and paginate; other queries return matches
        // in store order
        if let Query::Records(records_query) = query {
            let (entries, cursor) =
                records_query.sort_and_paginate(matches).map_err(|e| anyhow!(e))?;
            return Ok((entries, cursor));
        }
        Ok((matches, None))
    }

    async fn get(&self, owner: &str, message_cid: &str) -> Result<Option<Entry>> {
        let messages = self.messages.read().expect("poisoned");
        Ok(messages.get(owner).and_then(|entries| entries.get(message_cid)).cloned())
    }

    async fn delete(&self, owner: &str, message_cid: &str) -> Result<()> {
        let mut messages = self.messages.write().expect("poisoned");
        if let Some(entries) = messages.get_mut(owner) {
            entries.remove(message_cid);
        }
        Ok(())
    }

    async fn purge(&self) -> Result<()> {
        self.messages.write().expect("poisoned").clear();
        Ok(())
    }
}

impl BlockStore for ProviderImpl {
    async fn put(&self, _owner: &str, cid: &str, block: &[u8]) -> Result<()> {
        let block_cid = cid::Cid::from_str(cid)?;
        self.blocks.put_keyed(&block_cid, block).await.map_err(Into::into)
    }

    async fn get(&self, _owner: &str, cid: &str) -> Result<Option<Vec<u8>>> {
        let block_cid = cid::Cid::try_from(cid)?;
        Ok(self.blocks.get(&block_cid).await?)
    }

    async fn delete(&self, _owner: &str, cid: &str) -> Result<()> {
        let block_cid = cid::Cid::from_str(cid)?;
        self.blocks.remove(&block_cid).await?;
        Ok(())
    }

    async fn purge(&self) -> Result<()> {
        unimplemented!("purge the block store by dropping the provider")
    }
}

impl DataStore for ProviderImpl {
    async fn put(
        &self, owner: &str, record_id: &str, _data_cid: &str, data: DataStream,
    ) -> Result<(String, usize)> {
        // chunk the payload into blocks; the computed root CID is returned
        // for the caller to verify
        let (computed_cid, size) = data::put(owner, &data, self).await.map_err(|e| anyhow!(e))?;

        let mut data_refs = self.data_refs.write().expect("poisoned");
        let object = data_refs
            .entry(owner.to_string())
            .or_default()
            .entry(computed_cid.clone())
            .or_insert_with(|| DataObject {
                size,
                records: HashSet::new(),
            });
        object.records.insert(record_id.to_string());

        Ok((computed_cid, size))
    }

    async fn get(&self, owner: &str, record_id: &str, data_cid: &str) -> Result<Option<DataStream>> {
        {
            let data_refs = self.data_refs.read().expect("poisoned");
            let associated = data_refs
                .get(owner)
                .and_then(|objects| objects.get(data_cid))
                .is_some_and(|object| object.records.contains(record_id));
            if !associated {
                return Ok(None);
            }
        }
        data::get(owner, data_cid, self).await.map_err(|e| anyhow!(e))
    }

    async fn associate(&self, owner: &str, record_id: &str, data_cid: &str) -> Result<Option<usize>> {
        let mut data_refs = self.data_refs.write().expect("poisoned");
        let Some(object) = data_refs.get_mut(owner).and_then(|objects| objects.get_mut(data_cid))
        else {
            return Ok(None);
        };
        object.records.insert(record_id.to_string());
        Ok(Some(object.size))
    }

    async fn delete(&self, owner: &str, record_id: &str, data_cid: &str) -> Result<()> {
        // remove the record's reference; the object goes once unreferenced
        let unreferenced = {
            let mut data_refs = self.data_refs.write().expect("poisoned");
            let Some(objects) = data_refs.get_mut(owner) else {
                return Ok(());
            };
            let Some(object) = objects.get_mut(data_cid) else {
                return Ok(());
            };
            object.records.remove(record_id);
            if object.records.is_empty() {
                objects.remove(data_cid);
                true
            } else {
                false
            }
        };

        if unreferenced {
            data::delete(owner, data_cid, self).await.map_err(|e| anyhow!(e))?;
        }
        Ok(())
    }

    async fn purge(&self) -> Result<()> {
        self.data_refs.write().expect("poisoned").clear();
        Ok(())
    }
}

impl EventLog for ProviderImpl {
    async fn append(&self, owner: &str, event: &Event) -> Result<()> {
        let watermark = self.watermark.fetch_add(1, Ordering::SeqCst) + 1;
        let mut events = self.events.write().expect("poisoned");
        events.entry(owner.to_string()).or_default().push((watermark, event.clone()));
        Ok(())
    }

    async fn events(&self, owner: &str, cursor: Option<Cursor>) -> Result<(Vec<Event>, Option<Cursor>)> {
        let after = cursor.and_then(|c| c.value.parse::<u64>().ok()).unwrap_or_default();
        let events = self.events.read().expect("poisoned");
        let log = events.get(owner).cloned().unwrap_or_default();

        let matched: Vec<(u64, Event)> =
            log.into_iter().filter(|(watermark, _)| *watermark > after).collect();
        let cursor = matched.last().map(|(watermark, event)| Cursor {
            message_cid: event.cid().unwrap_or_default(),
            value: watermark.to_string(),
        });

        Ok((matched.into_iter().map(|(_, event)| event).collect(), cursor))
    }

    async fn query(&self, owner: &str, query: &Query) -> Result<(Vec<Event>, Option<Cursor>)> {
        let events = self.events.read().expect("poisoned");
        let log = events.get(owner).cloned().unwrap_or_default();

        let matched: Vec<(u64, Event)> =
            log.into_iter().filter(|(_, event)| query.is_match(event)).collect();
        let cursor = matched.last().map(|(watermark, event)| Cursor {
            message_cid: event.cid().unwrap_or_default(),
            value: watermark.to_string(),
        });

        Ok((matched.into_iter().map(|(_, event)| event).collect(), cursor))
    }

    async fn delete(&self, owner: &str, message_cid: &str) -> Result<()> {
        let mut events = self.events.write().expect("poisoned");
        if let Some(log) = events.get_mut(owner) {
            log.retain(|(_, event)| event.cid().unwrap_or_default() != message_cid);
        }
        Ok(())
    }

    async fn purge(&self) -> Result<()> {
        self.events.write().expect("poisoned").clear();
        Ok(())
    }
}

impl TaskStore for ProviderImpl {
    async fn register(&self, owner: &str, task: &ResumableTask, timeout_secs: u64) -> Result<()> {
        let mut tasks = self.tasks.write().expect("poisoned");
        tasks.entry(owner.to_string()).or_default().insert(task.id.clone(), TaskLease {
            task: task.clone(),
            expires_at: Instant::now() + Duration::from_secs(timeout_secs),
        });
        Ok(())
    }

    async fn grab(&self, owner: &str, count: u64) -> Result<Vec<ResumableTask>> {
        let mut tasks = self.tasks.write().expect("poisoned");
        let Some(leases) = tasks.get_mut(owner) else {
            return Ok(Vec::new());
        };

        let now = Instant::now();
        let mut grabbed = Vec::new();
        for lease in leases.values_mut() {
            if grabbed.len() as u64 >= count {
                break;
            }
            if lease.expires_at <= now {
                // grabbing re-leases the task so a peer cannot take it
                lease.expires_at = now + Duration::from_secs(dwn_core::tasks::LEASE_SECS);
                grabbed.push(lease.task.clone());
            }
        }
        Ok(grabbed)
    }

    async fn read(&self, owner: &str, task_id: &str) -> Result<Option<ResumableTask>> {
        let tasks = self.tasks.read().expect("poisoned");
        Ok(tasks.get(owner).and_then(|leases| leases.get(task_id)).map(|lease| lease.task.clone()))
    }

    async fn extend(&self, owner: &str, task_id: &str, timeout_secs: u64) -> Result<()> {
        let mut tasks = self.tasks.write().expect("poisoned");
        if let Some(lease) = tasks.get_mut(owner).and_then(|leases| leases.get_mut(task_id)) {
            lease.expires_at = Instant::now() + Duration::from_secs(timeout_secs);
        }
        Ok(())
    }

    async fn delete(&self, owner: &str, task_id: &str) -> Result<()> {
        let mut tasks = self.tasks.write().expect("poisoned");
        if let Some(leases) = tasks.get_mut(owner) {
            leases.remove(task_id);
        }
        Ok(())
    }

    async fn purge(&self, owner: &str) -> Result<()> {
        self.tasks.write().expect("poisoned").remove(owner);
        Ok(())
    }
}

impl EventStream for ProviderImpl {
    async fn subscribe(&self, owner: &str, filter: SubscribeFilter) -> Result<Subscriber> {
        let (sender, receiver) = mpsc::unbounded();
        let mut subscribers = self.subscribers.write().expect("poisoned");
        subscribers.entry(owner.to_string()).or_default().push(Subscription { filter, sender });
        Ok(Subscriber::new(Box::pin(receiver)))
    }

    async fn emit(&self, owner: &str, event: &Event) -> Result<()> {
        let mut subscribers = self.subscribers.write().expect("poisoned");
        let Some(subscriptions) = subscribers.get_mut(owner) else {
            return Ok(());
        };
        subscriptions.retain(|subscription| !subscription.sender.is_closed());
        for subscription in subscriptions {
            if subscription.filter.is_match(event) {
                // best-effort: a closed receiver drops the event
                let _ = subscription.sender.unbounded_send(event.clone());
            }
        }
        Ok(())
    }
}

impl DidResolver for ProviderImpl {
    async fn resolve(&self, url: &str) -> Result<Document> {
        // did:key documents are derived from the DID itself
        let Some(key) = url.strip_prefix("did:key:") else {
            return Err(anyhow!("unsupported DID method: {url}"));
        };
        let (_, bytes) = multibase::decode(key)?;
        if bytes.len() != 34 || bytes[0..2] != [0xed, 0x01] {
            return Err(anyhow!("unsupported key type for {url}"));
        }

        Ok(Document {
            id: url.to_string(),
            verification_method: vec![VerificationMethod {
                id: format!("{url}#{key}"),
                controller: url.to_string(),
                method_type: "Ed25519VerificationKey2020".to_string(),
                public_key_multibase: Some(key.to_string()),
            }],
        })
    }
}

impl KeyStore for ProviderImpl {
    fn keyring(&self, controller: &str) -> Result<impl Keyring> {
        key_store::keyring(controller)
    }
}
