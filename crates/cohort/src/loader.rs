//! Batching with seeded shuffling and worker-thread prefetch.
//!
//! Workers build whole batches: with `n` workers, worker `w` owns batches
//! `w, w + n, w + 2n, …` of the epoch's index order and pushes them into one
//! bounded channel. The consumer re-orders by batch index, so the sequence of
//! batches depends only on `(seed, epoch)` and never on worker timing.

use std::collections::BTreeMap;
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::thread::JoinHandle;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::config::DataConfig;
use crate::dataset::{Sample, SampleProvider};
use crate::error::{CohortError, CohortResult};

/// Samples stacked into contiguous `(B, C, H, W)` buffers.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Dataset indices of the samples, in batch order.
    pub indices: Vec<usize>,
    /// `[B, C, H, W]`.
    pub shape: [usize; 4],
    pub images: Vec<f32>,
    /// `(B, 1, H, W)` masks when the samples carry them.
    pub masks: Option<Vec<f32>>,
    pub labels: Option<Vec<i64>>,
    /// Second views, same shape as `images`.
    pub augmented: Option<Vec<f32>>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.shape[0]
    }

    pub fn is_empty(&self) -> bool {
        self.shape[0] == 0
    }

    /// Stack samples. Every sample must have the image shape of the first one
    /// and the same set of optional fields.
    pub fn collate(indices: Vec<usize>, samples: Vec<Sample>) -> CohortResult<Self> {
        let first = samples
            .first()
            .ok_or_else(|| CohortError::EmptyDataset("batch".into()))?;
        let [c, h, w] = first.image.shape();
        let has_mask = first.mask.is_some();
        let has_label = first.label.is_some();
        let has_aug = first.augmented.is_some();

        let b = samples.len();
        let mut images = Vec::with_capacity(b * c * h * w);
        let mut masks = has_mask.then(|| Vec::with_capacity(b * h * w));
        let mut labels = has_label.then(|| Vec::with_capacity(b));
        let mut augmented = has_aug.then(|| Vec::with_capacity(b * c * h * w));

        for sample in samples {
            let expected = vec![c, h, w];
            check_shape(&expected, &sample.image.shape())?;
            images.extend_from_slice(&sample.image.data);

            match (&mut masks, sample.mask) {
                (Some(buf), Some(mask)) => {
                    check_shape(&[1, h, w], &mask.shape())?;
                    buf.extend_from_slice(&mask.data);
                }
                (None, None) => {}
                (_, other) => {
                    return Err(CohortError::ShapeMismatch {
                        expected: if has_mask { vec![1, h, w] } else { vec![] },
                        actual: other.map(|m| m.shape().to_vec()).unwrap_or_default(),
                    })
                }
            }

            match (&mut labels, sample.label) {
                (Some(buf), Some(label)) => buf.push(label),
                (None, None) => {}
                (_, other) => {
                    return Err(CohortError::ShapeMismatch {
                        expected: if has_label { vec![1] } else { vec![] },
                        actual: if other.is_some() { vec![1] } else { vec![] },
                    })
                }
            }

            match (&mut augmented, sample.augmented) {
                (Some(buf), Some(aug)) => {
                    check_shape(&expected, &aug.shape())?;
                    buf.extend_from_slice(&aug.data);
                }
                (None, None) => {}
                (_, other) => {
                    return Err(CohortError::ShapeMismatch {
                        expected: if has_aug { expected } else { vec![] },
                        actual: other.map(|a| a.shape().to_vec()).unwrap_or_default(),
                    })
                }
            }
        }

        Ok(Self {
            indices,
            shape: [b, c, h, w],
            images,
            masks,
            labels,
            augmented,
        })
    }
}

fn check_shape(expected: &[usize], actual: &[usize; 3]) -> CohortResult<()> {
    if expected != actual.as_slice() {
        return Err(CohortError::ShapeMismatch {
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        });
    }
    Ok(())
}

fn load_batch(dataset: &dyn SampleProvider, indices: &[usize]) -> CohortResult<Batch> {
    let samples = indices
        .iter()
        .map(|&i| dataset.get(i))
        .collect::<CohortResult<Vec<_>>>()?;
    Batch::collate(indices.to_vec(), samples)
}

/// Turns a shared sample provider into per-epoch batch streams.
#[derive(Clone)]
pub struct BatchProvider {
    dataset: Arc<dyn SampleProvider>,
    batch_size: usize,
    num_workers: usize,
    shuffle: bool,
    seed: u64,
    prefetch: usize,
}

impl std::fmt::Debug for BatchProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchProvider")
            .field("dataset", &self.dataset.name())
            .field("len", &self.dataset.len())
            .field("batch_size", &self.batch_size)
            .field("num_workers", &self.num_workers)
            .field("shuffle", &self.shuffle)
            .field("seed", &self.seed)
            .finish()
    }
}

impl BatchProvider {
    /// Inline, unshuffled loading.
    pub fn new(dataset: Arc<dyn SampleProvider>, batch_size: usize) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            num_workers: 0,
            shuffle: false,
            seed: 0,
            prefetch: 2,
        }
    }

    /// Loader parameters from the data config.
    pub fn from_config(dataset: Arc<dyn SampleProvider>, config: &DataConfig, shuffle: bool) -> Self {
        let provider = Self::new(dataset, config.batch_size).with_workers(config.num_workers, config.prefetch);
        if shuffle {
            provider.with_shuffle(config.seed)
        } else {
            provider
        }
    }

    pub fn with_workers(mut self, num_workers: usize, prefetch: usize) -> Self {
        self.num_workers = num_workers;
        self.prefetch = prefetch.max(1);
        self
    }

    pub fn with_shuffle(mut self, seed: u64) -> Self {
        self.shuffle = true;
        self.seed = seed;
        self
    }

    pub fn dataset(&self) -> &Arc<dyn SampleProvider> {
        &self.dataset
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.dataset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    /// Batches per epoch, counting the partial last batch.
    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    /// Sample order of `epoch`.
    pub fn order(&self, epoch: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }
        order
    }

    /// Iterator over the batches of `epoch`.
    pub fn epoch(&self, epoch: usize) -> EpochIter {
        let chunks: Vec<Vec<usize>> = self
            .order(epoch)
            .chunks(self.batch_size)
            .map(|c| c.to_vec())
            .collect();
        let total = chunks.len();

        if self.num_workers == 0 || total == 0 {
            return EpochIter {
                total,
                next: 0,
                done: false,
                source: Source::Inline {
                    dataset: Arc::clone(&self.dataset),
                    chunks,
                },
            };
        }

        let workers = self.num_workers.min(total);
        let chunks = Arc::new(chunks);
        let (tx, rx) = sync_channel(self.prefetch);
        let mut handles = Vec::with_capacity(workers);
        for w in 0..workers {
            let tx = tx.clone();
            let chunks = Arc::clone(&chunks);
            let dataset = Arc::clone(&self.dataset);
            handles.push(std::thread::spawn(move || {
                for idx in (w..chunks.len()).step_by(workers) {
                    let result = load_batch(dataset.as_ref(), &chunks[idx]);
                    let failed = result.is_err();
                    if tx.send((idx, result)).is_err() || failed {
                        break;
                    }
                }
            }));
        }
        tracing::debug!(
            dataset = self.dataset.name(),
            epoch,
            batches = total,
            workers,
            "Started loader workers"
        );

        EpochIter {
            total,
            next: 0,
            done: false,
            source: Source::Workers {
                rx: Some(rx),
                pending: BTreeMap::new(),
                handles,
            },
        }
    }
}

enum Source {
    Inline {
        dataset: Arc<dyn SampleProvider>,
        chunks: Vec<Vec<usize>>,
    },
    Workers {
        rx: Option<Receiver<(usize, CohortResult<Batch>)>>,
        pending: BTreeMap<usize, CohortResult<Batch>>,
        handles: Vec<JoinHandle<()>>,
    },
}

/// Batches of one epoch in index order. Stops after the first error.
pub struct EpochIter {
    total: usize,
    next: usize,
    done: bool,
    source: Source,
}

impl EpochIter {
    fn next_batch(&mut self) -> CohortResult<Batch> {
        let idx = self.next;
        match &mut self.source {
            Source::Inline { dataset, chunks } => load_batch(dataset.as_ref(), &chunks[idx]),
            Source::Workers { rx, pending, .. } => loop {
                if let Some(result) = pending.remove(&idx) {
                    return result;
                }
                let received = rx.as_ref().map(|r| r.recv());
                match received {
                    Some(Ok((i, result))) => {
                        pending.insert(i, result);
                    }
                    _ => return Err(CohortError::WorkerDisconnected(idx)),
                }
            },
        }
    }
}

impl Iterator for EpochIter {
    type Item = CohortResult<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.next >= self.total {
            return None;
        }
        let result = self.next_batch();
        self.next += 1;
        if result.is_err() {
            self.done = true;
        }
        Some(result)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = if self.done { 0 } else { self.total - self.next };
        (0, Some(left))
    }
}

impl Drop for EpochIter {
    fn drop(&mut self) {
        if let Source::Workers { rx, pending, handles } = &mut self.source {
            // Closing the receiver makes blocked senders fail and exit.
            pending.clear();
            rx.take();
            for handle in handles.drain(..) {
                let _ = handle.join();
            }
        }
    }
}
