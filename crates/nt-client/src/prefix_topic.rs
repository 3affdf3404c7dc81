//! Prefix subscription aggregator: fires for any topic whose name begins
//! with its prefix (§4.5).

use crate::messenger::Messenger;
use crate::topic::SubscriberCallback;
use nt_protocol::{AnnounceParams, SubscribeOptions, SubscribeParams, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

struct Subscriber {
    callback: SubscriberCallback,
    options: SubscribeOptions,
}

struct State {
    last_changed: u64,
    subscribers: HashMap<i64, Subscriber>,
}

pub struct PrefixTopic {
    prefix: String,
    messenger: Arc<Messenger>,
    state: Mutex<State>,
}

impl PrefixTopic {
    pub(crate) fn new(prefix: String, messenger: Arc<Messenger>) -> Arc<PrefixTopic> {
        Arc::new(PrefixTopic {
            prefix,
            messenger,
            state: Mutex::new(State {
                last_changed: 0,
                subscribers: HashMap::new(),
            }),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn matches(&self, name: &str) -> bool {
        name.starts_with(&self.prefix)
    }

    /// Options are forced to `prefix = true` regardless of what the caller
    /// passed in.
    pub fn subscribe(
        &self,
        callback: SubscriberCallback,
        mut options: SubscribeOptions,
        id: Option<i64>,
        save: bool,
    ) -> i64 {
        options.prefix = Some(true);
        let subuid = id.unwrap_or_else(|| self.messenger.next_subuid());
        if id.is_none() {
            let params = SubscribeParams {
                topics: vec![self.prefix.clone()],
                subuid,
                options: options.clone(),
            };
            self.messenger.subscribe(params, false);
        }
        if save {
            self.state
                .lock()
                .unwrap()
                .subscribers
                .insert(subuid, Subscriber { callback, options });
        }
        subuid
    }

    pub fn unsubscribe(&self, subuid: i64, remove_callback: bool) {
        self.messenger.unsubscribe(subuid);
        if remove_callback {
            self.state.lock().unwrap().subscribers.remove(&subuid);
        }
    }

    /// Unsubscribe every currently recorded subscriber, used by `cleanup`.
    pub fn unsubscribe_all(&self) {
        let subuids: Vec<i64> = self.state.lock().unwrap().subscribers.keys().copied().collect();
        for subuid in subuids {
            self.unsubscribe(subuid, true);
        }
    }

    pub(crate) fn update_value(&self, params: &AnnounceParams, value: &Value, server_time: u64) {
        let mut state = self.state.lock().unwrap();
        state.last_changed = server_time;
        for subscriber in state.subscribers.values() {
            if subscriber.options.is_topics_only() {
                continue;
            }
            let callback = subscriber.callback.clone();
            let value = value.clone();
            let params = params.clone();
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(&value, &params);
            }));
            if outcome.is_err() {
                tracing::warn!(prefix = %self.prefix, "subscriber callback panicked, isolating");
            }
        }
    }

    /// Bookkeeping hooks the Registry calls for matching announce/unannounce
    /// events; prefix subscribers only receive values, so these currently
    /// have no externally visible effect beyond tracing.
    pub(crate) fn announce(&self, params: &AnnounceParams) {
        tracing::debug!(prefix = %self.prefix, topic = %params.name, id = params.id, "prefix match on announce");
    }

    pub(crate) fn unannounce(&self, params: &AnnounceParams) {
        tracing::debug!(prefix = %self.prefix, topic = %params.name, id = params.id, "prefix match on unannounce");
    }

    pub fn resubscribe_all(&self) {
        let entries: Vec<(i64, SubscribeOptions)> = self
            .state
            .lock()
            .unwrap()
            .subscribers
            .iter()
            .map(|(subuid, sub)| (*subuid, sub.options.clone()))
            .collect();
        for (subuid, options) in entries {
            self.messenger.subscribe(
                SubscribeParams {
                    topics: vec![self.prefix.clone()],
                    subuid,
                    options,
                },
                true,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::socket::Socket;

    fn test_prefix(prefix: &str) -> Arc<PrefixTopic> {
        let config = ClientConfig::with_exact_url("ws://127.0.0.1:1/nt/x");
        let socket = Socket::connect(config.clone());
        let (messenger, _rx) = Messenger::new(socket, &config);
        PrefixTopic::new(prefix.to_owned(), messenger)
    }

    #[test]
    fn matches_is_a_plain_prefix_check() {
        let prefix = test_prefix("/MyTable/Accelerometer/");
        assert!(prefix.matches("/MyTable/Accelerometer/X"));
        assert!(!prefix.matches("/MyTable/Other"));
    }

    #[test]
    fn empty_prefix_matches_every_name() {
        let prefix = test_prefix("");
        assert!(prefix.matches("/anything/at/all"));
    }

    #[test]
    fn options_are_forced_to_prefix_even_when_caller_omits_it() {
        let prefix = test_prefix("/a/");
        let subuid = prefix.subscribe(
            Arc::new(|_v, _p| {}),
            SubscribeOptions::default(),
            Some(3),
            true,
        );
        let state = prefix.state.lock().unwrap();
        assert!(state.subscribers.get(&subuid).unwrap().options.is_prefix());
    }
}
