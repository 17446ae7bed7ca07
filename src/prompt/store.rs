//! # Prompt Store
//!
//! Conversation threads and their messages.
//!
//! ```text
//! CONVERSATION          (conversation)                    -> Conversation
//! MESSAGE               (message)                         -> Message
//! CONVERSATION_USER     (user, started_at, conversation)  -> ()
//! CONVERSATION_TIME     (started_at, conversation)        -> ()
//! CONVERSATION_TAG      (tag, conversation)               -> ()
//! MESSAGE_CONVERSATION  (conversation, timestamp, seq, message) -> ()
//! ```
//!
//! `seq` is the conversation's message count at insertion, so messages that
//! share a timestamp keep their arrival order.

use chrono::{DateTime, Utc};
use eyre::{bail, Result};
use tracing::{debug, info};

use super::types::{Conversation, ConversationWithMessages, Message};
use crate::btree::ScanEnd;
use crate::database::{KvIter, KvRead, TreeStore, WriteTxn};
use crate::encoding::{decode_record, encode_record, str_field, table, KeyEncoder};
use crate::error::TreeStoreError;

fn conversation_key(conversation_id: &str) -> Vec<u8> {
    KeyEncoder::new(table::CONVERSATION)
        .str(conversation_id)
        .finish()
}

fn message_key(message_id: &str) -> Vec<u8> {
    KeyEncoder::new(table::MESSAGE).str(message_id).finish()
}

fn user_key(conv: &Conversation) -> Vec<u8> {
    KeyEncoder::new(table::CONVERSATION_USER)
        .str(&conv.user_id)
        .time(conv.started_at)
        .str(&conv.conversation_id)
        .finish()
}

fn time_key(conv: &Conversation) -> Vec<u8> {
    KeyEncoder::new(table::CONVERSATION_TIME)
        .time(conv.started_at)
        .str(&conv.conversation_id)
        .finish()
}

fn tag_key(tag: &str, conversation_id: &str) -> Vec<u8> {
    KeyEncoder::new(table::CONVERSATION_TAG)
        .str(tag)
        .str(conversation_id)
        .finish()
}

fn thread_prefix(conversation_id: &str) -> Vec<u8> {
    KeyEncoder::new(table::MESSAGE_CONVERSATION)
        .str(conversation_id)
        .finish()
}

fn thread_key(msg: &Message, seq: u64) -> Vec<u8> {
    KeyEncoder::new(table::MESSAGE_CONVERSATION)
        .str(&msg.conversation_id)
        .time(msg.timestamp)
        .uint64(seq)
        .str(&msg.message_id)
        .finish()
}

pub(crate) fn get_conversation_in<R: KvRead + ?Sized>(
    txn: &R,
    conversation_id: &str,
) -> Result<Option<Conversation>> {
    txn.get(&conversation_key(conversation_id))?
        .map(|bytes| decode_record(&bytes))
        .transpose()
}

fn get_message_in<R: KvRead + ?Sized>(txn: &R, message_id: &str) -> Result<Option<Message>> {
    txn.get(&message_key(message_id))?
        .map(|bytes| decode_record(&bytes))
        .transpose()
}

/// Thread index keys of a conversation, in message order.
fn thread_entries<R: KvRead + ?Sized>(txn: &R, conversation_id: &str) -> Result<Vec<Vec<u8>>> {
    txn.scan_prefix(&thread_prefix(conversation_id))?
        .map(|entry| entry.map(|(key, _)| key))
        .collect()
}

pub(crate) fn get_messages_in<R: KvRead + ?Sized>(
    txn: &R,
    conversation_id: &str,
) -> Result<Vec<Message>> {
    let mut messages = Vec::new();
    for key in thread_entries(txn, conversation_id)? {
        let message_id = str_field(&key, 3)?;
        let Some(msg) = get_message_in(txn, &message_id)? else {
            bail!(TreeStoreError::corruption(format!(
                "conversation {} lists missing message {}",
                conversation_id, message_id
            )));
        };
        messages.push(msg);
    }
    Ok(messages)
}

/// Loads the conversation named by the key field at `index` of each entry.
fn conversations_from<R: KvRead + ?Sized>(
    txn: &R,
    scan: KvIter<'_>,
    index: usize,
    limit: usize,
) -> Result<Vec<Conversation>> {
    let mut conversations = Vec::new();
    for entry in scan {
        if limit > 0 && conversations.len() >= limit {
            break;
        }
        let (key, _) = entry?;
        let conversation_id = str_field(&key, index)?;
        let Some(conv) = get_conversation_in(txn, &conversation_id)? else {
            bail!(TreeStoreError::corruption(format!(
                "conversation index points at missing {}",
                conversation_id
            )));
        };
        conversations.push(conv);
    }
    Ok(conversations)
}

/// Most recently started first.
pub(crate) fn list_by_user_in<R: KvRead + ?Sized>(
    txn: &R,
    user_id: &str,
    limit: usize,
) -> Result<Vec<Conversation>> {
    let prefix = KeyEncoder::new(table::CONVERSATION_USER)
        .str(user_id)
        .finish();
    conversations_from(txn, txn.scan_prefix_rev(&prefix)?, 2, limit)
}

pub(crate) fn list_by_tag_in<R: KvRead + ?Sized>(
    txn: &R,
    tag: &str,
    limit: usize,
) -> Result<Vec<Conversation>> {
    let prefix = KeyEncoder::new(table::CONVERSATION_TAG).str(tag).finish();
    conversations_from(txn, txn.scan_prefix(&prefix)?, 1, limit)
}

fn unlink_conversation(txn: &mut WriteTxn<'_>, conv: &Conversation) -> Result<usize> {
    let thread = thread_entries(&*txn, &conv.conversation_id)?;
    for key in &thread {
        txn.delete(&message_key(&str_field(key, 3)?))?;
        txn.delete(key)?;
    }

    txn.delete(&conversation_key(&conv.conversation_id))?;
    txn.delete(&user_key(conv))?;
    txn.delete(&time_key(conv))?;
    for tag in &conv.tags {
        txn.delete(&tag_key(tag, &conv.conversation_id))?;
    }
    Ok(thread.len())
}

#[derive(Debug, Clone)]
pub struct PromptStore {
    store: TreeStore,
}

impl PromptStore {
    pub fn new(store: TreeStore) -> Self {
        Self { store }
    }

    /// Stores a new conversation header and its user, time and tag index
    /// entries. An existing id is a [`TreeStoreError::Conflict`].
    pub fn create_conversation(&self, conv: &Conversation) -> Result<()> {
        self.store.update(|txn| {
            let key = conversation_key(&conv.conversation_id);
            if txn.get(&key)?.is_some() {
                bail!(TreeStoreError::Conflict(format!(
                    "conversation {} already exists",
                    conv.conversation_id
                )));
            }
            txn.insert(&key, &encode_record(conv)?)?;
            txn.insert(&user_key(conv), &[])?;
            txn.insert(&time_key(conv), &[])?;
            for tag in &conv.tags {
                txn.insert(&tag_key(tag, &conv.conversation_id), &[])?;
            }
            Ok(())
        })?;
        debug!(
            conversation_id = %conv.conversation_id,
            user_id = %conv.user_id,
            "conversation created"
        );
        Ok(())
    }

    /// Appends a message and bumps the conversation's count and last
    /// message time in the same transaction.
    ///
    /// Fails with [`TreeStoreError::NotFound`] for an unknown conversation and
    /// [`TreeStoreError::Conflict`] for a reused message id.
    pub fn add_message(&self, msg: &Message) -> Result<Conversation> {
        self.store.update(|txn| {
            let Some(mut conv) = get_conversation_in(&*txn, &msg.conversation_id)? else {
                bail!(TreeStoreError::not_found(
                    "conversation",
                    msg.conversation_id.as_str()
                ));
            };
            let key = message_key(&msg.message_id);
            if txn.get(&key)?.is_some() {
                bail!(TreeStoreError::Conflict(format!(
                    "message {} already exists",
                    msg.message_id
                )));
            }

            txn.insert(&key, &encode_record(msg)?)?;
            txn.insert(&thread_key(msg, conv.message_count), &[])?;

            conv.message_count += 1;
            if msg.timestamp > conv.last_message_at {
                conv.last_message_at = msg.timestamp;
            }
            txn.insert(
                &conversation_key(&conv.conversation_id),
                &encode_record(&conv)?,
            )?;
            Ok(conv)
        })
    }

    pub fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        self.store
            .view(|txn| get_conversation_in(txn, conversation_id))
    }

    pub fn get_message(&self, message_id: &str) -> Result<Option<Message>> {
        self.store.view(|txn| get_message_in(txn, message_id))
    }

    /// Messages in arrival order.
    pub fn get_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        self.store
            .view(|txn| get_messages_in(txn, conversation_id))
    }

    pub fn get_conversation_with_messages(
        &self,
        conversation_id: &str,
    ) -> Result<Option<ConversationWithMessages>> {
        self.store.view(|txn| {
            let Some(conversation) = get_conversation_in(txn, conversation_id)? else {
                return Ok(None);
            };
            let messages = get_messages_in(txn, conversation_id)?;
            Ok(Some(ConversationWithMessages {
                conversation,
                messages,
            }))
        })
    }

    /// A user's conversations, most recently started first. `limit` 0 means
    /// no limit.
    pub fn list_conversations_by_user(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<Conversation>> {
        self.store
            .view(|txn| list_by_user_in(txn, user_id, limit))
    }

    /// Conversations carrying `tag`, ordered by conversation id.
    pub fn list_conversations_by_tag(&self, tag: &str, limit: usize) -> Result<Vec<Conversation>> {
        self.store.view(|txn| list_by_tag_in(txn, tag, limit))
    }

    /// Conversations started within `[from, to]`, oldest first.
    pub fn list_conversations_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Conversation>> {
        self.store.view(|txn| {
            let start = KeyEncoder::new(table::CONVERSATION_TIME).time(from).finish();
            let end = KeyEncoder::new(table::CONVERSATION_TIME)
                .time(to)
                .finish_partial();
            let scan = txn.scan(&start, ScanEnd::Inclusive(end))?;
            let mut found = conversations_from(txn, scan, 1, 0)?;
            found.retain(|c| c.started_at >= from && c.started_at <= to);
            if limit > 0 {
                found.truncate(limit);
            }
            Ok(found)
        })
    }

    /// Removes the conversation, its messages and every index entry.
    pub fn delete_conversation(&self, conversation_id: &str) -> Result<bool> {
        let removed = self.store.update(|txn| {
            match get_conversation_in(&*txn, conversation_id)? {
                Some(conv) => unlink_conversation(txn, &conv).map(Some),
                None => Ok(None),
            }
        })?;
        match removed {
            Some(messages) => {
                info!(%conversation_id, messages, "conversation deleted");
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
