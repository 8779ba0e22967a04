//! In-process transport double for tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::feedback::error::TransportError;
use crate::feedback::transport::Transport;

/// A message the fake "sent".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sent {
    pub chat_id: i64,
    pub text: String,
    pub reply_to: Option<i64>,
}

/// Records outbound messages and answers membership questions from fixed tables.
#[derive(Default)]
pub struct FakeTransport {
    pub sent: Mutex<Vec<Sent>>,
    /// (group_id, user_id) pairs that are admins.
    pub admins: Mutex<HashSet<(i64, i64)>>,
    /// (group_id, lowercase username) -> user id.
    pub usernames: Mutex<HashMap<(i64, String), i64>>,
    pub fail_sends: Mutex<bool>,
    pub fail_lookups: Mutex<bool>,
    pub panic_sends: Mutex<bool>,
}

impl FakeTransport {
    pub fn with_admin(self, group_id: i64, user_id: i64) -> Self {
        self.admins.lock().unwrap().insert((group_id, user_id));
        self
    }

    pub fn with_username(self, group_id: i64, username: &str, user_id: i64) -> Self {
        self.usernames
            .lock()
            .unwrap()
            .insert((group_id, username.to_lowercase()), user_id);
        self
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn set_fail_sends(&self, fail: bool) {
        *self.fail_sends.lock().unwrap() = fail;
    }

    pub fn set_panic_sends(&self, panic: bool) {
        *self.panic_sends.lock().unwrap() = panic;
    }

    pub fn set_fail_lookups(&self, fail: bool) {
        *self.fail_lookups.lock().unwrap() = fail;
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send_text(
        &self,
        chat_id: i64,
        html: &str,
        reply_to: Option<i64>,
    ) -> Result<i64, TransportError> {
        if *self.panic_sends.lock().unwrap() {
            panic!("transport blew up");
        }
        if *self.fail_sends.lock().unwrap() {
            return Err(TransportError("send failed".into()));
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push(Sent { chat_id, text: html.to_string(), reply_to });
        Ok(sent.len() as i64)
    }

    async fn is_group_admin(&self, group_id: i64, user_id: i64) -> Result<bool, TransportError> {
        if *self.fail_lookups.lock().unwrap() {
            return Err(TransportError("lookup failed".into()));
        }
        Ok(self.admins.lock().unwrap().contains(&(group_id, user_id)))
    }

    async fn resolve_username(
        &self,
        group_id: i64,
        username: &str,
    ) -> Result<Option<i64>, TransportError> {
        if *self.fail_lookups.lock().unwrap() {
            return Err(TransportError("lookup failed".into()));
        }
        Ok(self
            .usernames
            .lock()
            .unwrap()
            .get(&(group_id, username.to_lowercase()))
            .copied())
    }
}
