use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::Result;
use crate::searcher::{Query, SearchResult, Searcher};

/// Keystroke coalescing window.
const DEBOUNCE: Duration = Duration::from_millis(150);

enum Msg {
    Query { generation: u64, query: Query },
    Stop,
}

pub type ResultCallback = Box<dyn Fn(u64, Result<Vec<SearchResult>>) + Send>;

/// Cooperative wrapper for search-as-you-type: queries submitted faster
/// than the debounce window collapse to the newest one, and a result whose
/// query was superseded while searching is dropped instead of delivered.
/// The underlying `search` stays synchronous; cancellation is the caller
/// abandoning the result.
pub struct LiveSearch {
    tx: Sender<Msg>,
    latest: Arc<AtomicU64>,
    worker: Option<JoinHandle<()>>,
}

impl LiveSearch {
    pub fn spawn(searcher: Searcher, on_results: ResultCallback) -> Self {
        let (tx, rx) = unbounded::<Msg>();
        let latest = Arc::new(AtomicU64::new(0));
        let latest_worker = Arc::clone(&latest);

        let worker = std::thread::spawn(move || loop {
            let (mut generation, mut query) = match rx.recv() {
                Ok(Msg::Query { generation, query }) => (generation, query),
                Ok(Msg::Stop) | Err(_) => return,
            };

            // Debounce: absorb everything that arrives within the window,
            // keeping only the newest query.
            loop {
                match rx.recv_timeout(DEBOUNCE) {
                    Ok(Msg::Query {
                        generation: g,
                        query: q,
                    }) => {
                        generation = g;
                        query = q;
                    }
                    Ok(Msg::Stop) => return,
                    Err(RecvTimeoutError::Timeout) => break,
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }

            let results = searcher.search(&query);

            // A newer submission arrived while we were searching: this
            // result is logically abandoned.
            if latest_worker.load(Ordering::SeqCst) == generation {
                on_results(generation, results);
            } else {
                tracing::debug!("dropping superseded search result (generation {generation})");
            }
        });

        Self {
            tx,
            latest,
            worker: Some(worker),
        }
    }

    /// Queue a query; returns its generation so the caller can correlate
    /// delivered results.
    pub fn submit(&self, query: Query) -> u64 {
        let generation = self.latest.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.tx.send(Msg::Query { generation, query });
        generation
    }
}

impl Drop for LiveSearch {
    fn drop(&mut self) {
        let _ = self.tx.send(Msg::Stop);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
