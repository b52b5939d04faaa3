//! Smooths node embeddings toward their neighborhoods.
use std::io::Write;
use std::path::Path;
use std::sync::mpsc::sync_channel;
use std::thread;

use rayon::prelude::*;
use tempfile::NamedTempFile;
use tracing::info;

use crate::algos::utils::axpy;
use crate::distance::Distance;
use crate::embeddings::EmbeddingStore;
use crate::error::{Error,Result};
use crate::graph::{CDFGraph,CDFtoP,NodeID};
use crate::io::{is_gzip,EmbeddingWriter};
use crate::progress::CLProgressBar;
use crate::vocab::Vocab;

/// Nodes aligned per unit of work handed to the writer.
const ALIGN_CHUNK: usize = 1024;

/// Chunks allowed to queue up before producers wait on the writer.
const MAX_QUEUED_CHUNKS: usize = 8;

pub struct NeighborhoodAligner {
    /// Weight given to the neighborhood average; 0 keeps the original embedding.
    pub alignment: f32,

    /// Only the first `max_neighbors` edges of each node are averaged
    pub max_neighbors: Option<usize>,

    pub indicator: bool
}

impl NeighborhoodAligner {
    pub fn new(alignment: f32, max_neighbors: Option<usize>) -> Result<Self> {
        if !(0f32..=1f32).contains(&alignment) {
            return Err(Error::InvalidConfig(format!("alignment must be in [0, 1], got {}", alignment)))
        }
        Ok(NeighborhoodAligner { alignment, max_neighbors, indicator: false })
    }

    /// Writes the aligned embedding for `node` into `new_emb`.  Nodes without neighbors keep
    /// their own embedding.
    pub fn align(
        &self,
        graph: &impl CDFGraph,
        embeddings: &EmbeddingStore,
        node: NodeID,
        new_emb: &mut [f32]
    ) {
        embeddings.read_into(node, new_emb);

        let (edges, weights) = graph.get_edges(node);
        let n = self.max_neighbors.unwrap_or(edges.len()).min(edges.len());
        if n == 0 || self.alignment == 0. { return }

        let mut p: Vec<f32> = CDFtoP::new(weights).take(n).collect();
        let total: f32 = p.iter().sum();
        if total > 0. {
            p.iter_mut().for_each(|pi| *pi /= total);
        } else {
            p.iter_mut().for_each(|pi| *pi = 1. / n as f32);
        }

        // Weighted average of the neighborhood
        let mut avg = vec![0f32; new_emb.len()];
        let mut e = vec![0f32; new_emb.len()];
        edges[..n].iter().zip(p.iter()).for_each(|(out_node, weight)| {
            embeddings.read_into(*out_node, &mut e);
            axpy(*weight, &e, &mut avg);
        });

        // Blend it with the original node
        new_emb.iter_mut().zip(avg.iter()).for_each(|(wi, ai)| {
            *wi = (1. - self.alignment) * *wi + self.alignment * ai;
        });
    }

    /// Aligns every node into a new table.
    pub fn align_all(&self, graph: &(impl CDFGraph + Sync), embeddings: &EmbeddingStore) -> EmbeddingStore {
        let aligned = EmbeddingStore::new(embeddings.len(), embeddings.dims(), Distance::Cosine);
        (0..embeddings.len()).into_par_iter().for_each(|node| {
            let mut emb = vec![0f32; embeddings.dims()];
            self.align(graph, embeddings, node, &mut emb);
            aligned.set_embedding(node, &emb);
        });
        aligned
    }

    /// Streams aligned embeddings into `writer` in node order.  Alignment runs on the rayon pool
    /// in chunks while this thread serializes; a bounded queue keeps at most a few chunks in
    /// memory at once.
    pub fn align_to_writer<W: Write>(
        &self,
        graph: &(impl CDFGraph + Sync),
        embeddings: &EmbeddingStore,
        writer: &mut EmbeddingWriter<W>
    ) -> Result<()> {
        let num_nodes = embeddings.len();
        let dims = embeddings.dims();
        let pb = CLProgressBar::new(num_nodes as u64, self.indicator);

        thread::scope(|s| {
            let (tx, rx) = sync_channel::<Vec<(NodeID, Vec<f32>)>>(MAX_QUEUED_CHUNKS);

            s.spawn(move || {
                for start in (0..num_nodes).step_by(ALIGN_CHUNK) {
                    let end = (start + ALIGN_CHUNK).min(num_nodes);
                    let chunk: Vec<_> = (start..end).into_par_iter().map(|node| {
                        let mut emb = vec![0f32; dims];
                        self.align(graph, embeddings, node, &mut emb);
                        (node, emb)
                    }).collect();

                    // Writer hung up after an error
                    if tx.send(chunk).is_err() { break }
                }
            });

            for chunk in rx.iter() {
                let n = chunk.len();
                writer.stream(chunk.into_iter())?;
                pb.inc(n as u64);
            }
            Ok::<(), Error>(())
        })?;

        pb.finish();
        info!(nodes = num_nodes, alignment = self.alignment, "Aligned node embeddings");
        Ok(())
    }

    /// Streams aligned embeddings to `path`.  Output goes to a temporary file in the same
    /// directory which only replaces `path` once everything was written.
    pub fn align_to_disk(
        &self,
        graph: &(impl CDFGraph + Sync),
        embeddings: &EmbeddingStore,
        vocab: &Vocab,
        path: impl AsRef<Path>,
        comp_level: Option<u32>
    ) -> Result<()> {
        let path = path.as_ref();
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new(".")
        };

        let tmp = NamedTempFile::new_in(dir)?;
        let mut writer = EmbeddingWriter::from_writer(tmp, vocab, is_gzip(path), comp_level);
        self.align_to_writer(graph, embeddings, &mut writer)?;
        let tmp = writer.finish()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}
