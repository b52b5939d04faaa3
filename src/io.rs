//! Loading and saving of graphs, feature sets and embedding tables.
use std::fs::File;
use std::io::{Write,BufWriter,Result as IOResult,BufReader,BufRead};
use std::path::Path;

use fast_float::parse;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use itertools::Itertools;
use rayon::prelude::*;
use ryu::Buffer;
use serde::{Serialize,Deserialize};
use tracing::{info,warn};

use crate::error::{Error,Result};
use crate::vocab::Vocab;
use crate::embeddings::EmbeddingStore;
use crate::distance::Distance;
use crate::feature_store::FeatureStore;
use crate::graph::{CSR,CumCSR,NodeID};

#[derive(Copy,Clone,Debug,PartialEq,Eq,Serialize,Deserialize)]
pub enum EdgeType {
    Directed,
    Undirected
}

pub(crate) fn is_gzip(path: &Path) -> bool {
    path.extension().map(|ext| ext == "gz").unwrap_or(false)
}

/// Output sink which is either plain or gzip compressed.  Unlike a boxed writer, finishing it
/// surfaces errors from the final flush rather than swallowing them on drop.
pub enum OutputEncoder<W: Write> {
    Plain(BufWriter<W>),
    Gzip(GzEncoder<BufWriter<W>>)
}

impl <W: Write> OutputEncoder<W> {
    pub fn new(inner: W, compression: Option<Compression>) -> Self {
        let bw = BufWriter::new(inner);
        match compression {
            Some(level) => OutputEncoder::Gzip(GzEncoder::new(bw, level)),
            None => OutputEncoder::Plain(bw)
        }
    }

    /// Flushes all buffered data and hands back the underlying writer.
    pub fn finish(self) -> IOResult<W> {
        let bw = match self {
            OutputEncoder::Plain(bw) => bw,
            OutputEncoder::Gzip(enc) => enc.finish()?
        };
        bw.into_inner().map_err(|e| e.into_error())
    }
}

impl <W: Write> Write for OutputEncoder<W> {
    fn write(&mut self, buf: &[u8]) -> IOResult<usize> {
        match self {
            OutputEncoder::Plain(w) => w.write(buf),
            OutputEncoder::Gzip(w) => w.write(buf)
        }
    }

    fn flush(&mut self) -> IOResult<()> {
        match self {
            OutputEncoder::Plain(w) => w.flush(),
            OutputEncoder::Gzip(w) => w.flush()
        }
    }
}

/// Streaming writer for NodeEmbeddings.  Since Embeddings are often gigantic, creating them adhoc
/// then streaming them to disk is beneficial.
pub struct EmbeddingWriter<'a, W: Write = File> {
    vocab: &'a Vocab,
    output: OutputEncoder<W>,
    formatter: Buffer,
    buffer: String
}

impl <'a> EmbeddingWriter<'a, File> {

    /// Opens `path` for writing; a `.gz` suffix enables compression.
    pub fn new(path: impl AsRef<Path>, vocab: &'a Vocab, comp_level: Option<u32>) -> Result<Self> {
        let path = path.as_ref();
        let f = File::create(path)?;
        Ok(EmbeddingWriter::from_writer(f, vocab, is_gzip(path), comp_level))
    }
}

impl <'a, W: Write> EmbeddingWriter<'a, W> {

    pub fn from_writer(inner: W, vocab: &'a Vocab, gzip: bool, comp_level: Option<u32>) -> Self {
        let compression = if gzip {
            Some(comp_level.map(Compression::new).unwrap_or(Compression::fast()))
        } else {
            None
        };

        EmbeddingWriter {
            vocab,
            output: OutputEncoder::new(inner, compression),
            formatter: Buffer::new(),
            buffer: String::new()
        }
    }

    pub fn write_embedding(&mut self, node_id: NodeID, emb: &[f32]) -> Result<()> {
        let (node_type, name) = self.vocab.get_name(node_id)
            .ok_or_else(|| Error::NotFound(format!("node id {} missing from vocab", node_id)))?;

        // Build the embedding to string
        self.buffer.clear();
        for (idx, wi) in emb.iter().enumerate() {
            if idx > 0 {
                self.buffer.push(',');
            }
            self.buffer.push_str(self.formatter.format(*wi));
        }

        // Spit it out
        writeln!(&mut self.output, "{}\t{}\t[{}]", node_type, name, self.buffer)?;
        Ok(())
    }

    pub fn stream<A: AsRef<[f32]>>(
        &mut self,
        it: impl Iterator<Item=(NodeID, A)>
    ) -> Result<()> {
        for (node_id, emb) in it {
            self.write_embedding(node_id, emb.as_ref())?;
        }
        Ok(())
    }

    /// Writes out an entire table in id order.
    pub fn write_store(&mut self, es: &EmbeddingStore) -> Result<()> {
        let mut emb = vec![0f32; es.dims()];
        for node_id in 0..es.len() {
            es.read_into(node_id, &mut emb);
            self.write_embedding(node_id, &emb)?;
        }
        Ok(())
    }

    pub fn finish(self) -> Result<W> {
        Ok(self.output.finish()?)
    }
}

/// Convenience function to persist a full table.
pub fn save_embeddings(
    path: impl AsRef<Path>,
    vocab: &Vocab,
    es: &EmbeddingStore,
    comp_level: Option<u32>
) -> Result<()> {
    let mut writer = EmbeddingWriter::new(path, vocab, comp_level)?;
    writer.write_store(es)?;
    writer.finish()?;
    Ok(())
}

struct RecordReader {
    chunk_size: usize,
    skip: usize
}

impl RecordReader {
    pub fn new(chunk_size: usize, skip: usize) -> Self {
        RecordReader { chunk_size, skip }
    }

    /// Maps lines to records, in parallel when chunked, and drains them in file order.  Line
    /// numbers handed to the mapper and drain are 1-based and include skipped rows.
    pub fn read<F,D,A,E>(
        &self,
        it: impl Iterator<Item=IOResult<String>>,
        mapper: F,
        mut drain: D
    ) -> std::result::Result<(),E>
        where F: Fn(usize, String) -> Option<A> + Sync,
              A: Send,
              D: FnMut(usize, A) -> std::result::Result<(),E>,
              E: From<std::io::Error>
    {
        // Skip records, such as headers of tsvs
        let mut it = it.enumerate().map(|(i, l)| (i + 1, l)).skip(self.skip);

        if self.chunk_size <= 1 {
            for (i, line) in it {
                if let Some(record) = mapper(i, line?) {
                    drain(i, record)?
                }
            }
        } else {
            let mut buffer = Vec::with_capacity(self.chunk_size);
            let mut p_buffer = Vec::with_capacity(self.chunk_size);
            let chunks = (&mut it).chunks(self.chunk_size);
            for chunk in &chunks {
                buffer.clear();

                // Read lines into a buffer for parallelizing
                for (i, line) in chunk {
                    buffer.push((i, line?));
                }

                buffer.par_drain(..).map(|(i, line)| {
                    (i, mapper(i, line))
                }).collect_into_vec(&mut p_buffer);

                for (i, r) in p_buffer.drain(..) {
                    if let Some(record) = r {
                        drain(i, record)?;
                    }
                }
            }
        }
        Ok(())
    }

}

pub fn open_file_for_reading(path: impl AsRef<Path>) -> IOResult<Box<dyn BufRead>> {
    let path = path.as_ref();
    let f = BufReader::new(File::open(path)?);
    let result: Box<dyn BufRead> = if is_gzip(path) {
        Box::new(BufReader::new(GzDecoder::new(f)))
    } else {
        Box::new(f)
    };
    Ok(result)
}

/// Count the embeddings a load will read so we only have to do one allocation.  Rows are skipped
/// before filtering, the same order `RecordReader` applies them in.
fn count_lines(path: &Path, node_type: Option<&str>, skip: usize) -> IOResult<usize> {
    let reader = open_file_for_reading(path)?;
    let mut count = 0;
    for line in reader.lines().skip(skip) {
        if has_node_type(&line?, node_type) {
            count += 1;
        }
    }
    Ok(count)
}

fn has_node_type(line: &str, node_type: Option<&str>) -> bool {
    match node_type {
        Some(t) => line.split('\t').next() == Some(t),
        None => true
    }
}

/// Reads a line and converts it to a node type, node name, and embedding.
fn line_to_embedding(line: &str) -> Option<(String,String,Vec<f32>)> {
    let pieces:Vec<_> = line.split('\t').collect();
    if pieces.len() != 3 {
        return None
    }

    let node_type = pieces[0];
    let name = pieces[1];
    let e = pieces[2].trim();
    if e.len() < 2 || !e.starts_with('[') || !e.ends_with(']') {
        return None
    }

    let inner = &e[1..e.len() - 1];
    let emb: std::result::Result<Vec<f32>,_> = if inner.trim().is_empty() {
        Ok(Vec::new())
    } else {
        inner.split(',').map(|wi| parse(wi.trim())).collect()
    };

    emb.ok().map(|e| (node_type.to_string(), name.to_string(), e))
}

pub struct EmbeddingReader;

impl EmbeddingReader {

    pub fn load(
        path: impl AsRef<Path>,
        distance: Distance,
        filter_type: Option<String>,
        chunk_size: Option<usize>,
        skip_rows: Option<usize>
    ) -> Result<(Vocab, EmbeddingStore)> {
        let path = path.as_ref();
        let skip = skip_rows.unwrap_or(0);
        let num_embeddings = count_lines(path, filter_type.as_deref(), skip)?;
        let reader = open_file_for_reading(path)?;

        let mut vocab = Vocab::new();

        // Place holder until we know the dimensions
        let mut es = EmbeddingStore::new(0, 0, distance);
        let rr = RecordReader::new(chunk_size.unwrap_or(1_000), skip);
        let mut i = 0;

        let filter_node = filter_type.as_deref();
        rr.read(reader.lines(),
            |line_no, line| {
               if !has_node_type(&line, filter_node) {
                   return None
               }

               Some(line_to_embedding(&line)
                    .ok_or_else(|| Error::MalformedLine {
                        line: line_no,
                        message: "Expected `type\\tname\\t[e1,...]`".into()
                    }))
            },
            |line_no, record| {
                let (node_type, node_name, emb) = record?;

                if i == 0 {
                    es = EmbeddingStore::new(num_embeddings, emb.len(), distance);
                }

                let node_id = vocab.get_or_insert(&node_type, &node_name);
                if node_id < i {
                    return Err(Error::MalformedLine {
                        line: line_no,
                        message: format!("found duplicate node {}:{}", node_type, node_name)
                    })
                }

                if emb.len() != es.dims() {
                    return Err(Error::DimensionMismatch { expected: es.dims(), found: emb.len() })
                }

                es.set_embedding(node_id, &emb);
                i += 1;
                Ok(())
            })?;

        info!(embeddings = vocab.len(), dims = es.dims(), "Loaded embeddings");
        Ok((vocab, es))
    }
}

pub struct GraphReader;

impl GraphReader {

    fn deduplicate_edges(
        edges: &mut Vec<(NodeID, NodeID, f32)>
    ) {
        // Sort edges and combine duplicates
        edges.par_sort_unstable_by_key(|e| (e.0, e.1));
        let mut i = 0;
        let mut j = 0;
        while j < edges.len() {
            let (from_node, to_node, _) = edges[j];
            let mut w = 0f32;
            while j < edges.len() && edges[j].0 == from_node && edges[j].1 == to_node {
                w += edges[j].2;
                j += 1
            }
            edges[i] = (from_node, to_node, w);
            i += 1;
        }
        edges.truncate(i);
    }

    /// Loads a tab separated edge file of `from_type from_name to_type to_name weight`.
    pub fn load(
        path: impl AsRef<Path>,
        edge_type: EdgeType,
        chunk_size: usize,
        skip_rows: usize,
        weighted: bool
    ) -> Result<(Vocab,CumCSR)> {
        let reader = open_file_for_reading(path)?.lines();

        let mut vocab = Vocab::new();
        let mut edges = Vec::new();
        let rr = RecordReader::new(chunk_size, skip_rows);
        rr.read(reader,
            |i, line| {
                let pieces: Vec<_> = line.split('\t').collect();
                if pieces.len() != 5 {
                    return Some(Err(Error::MalformedLine {
                        line: i,
                        message: "Malformed graph file: Expected 5 fields!".into()
                    }))
                }
                let w = if weighted {
                    match pieces[4].trim().parse::<f32>() {
                        Ok(w) => w,
                        Err(e) => return Some(Err(Error::MalformedLine {
                            line: i,
                            message: format!("Malformed graph file! {} - {:?}", e, pieces[4])
                        }))
                    }
                } else {
                    1f32
                };
                let from_node = (pieces[0].to_string(), pieces[1].to_string());
                let to_node = (pieces[2].to_string(), pieces[3].to_string());
                Some(Ok((from_node, to_node, w)))
            },
            |_i, record| {
                let (from_node, to_node, w) = record?;
                let f_id = vocab.get_or_insert(&from_node.0, &from_node.1);
                let t_id = vocab.get_or_insert(&to_node.0, &to_node.1);
                if !w.is_finite() || w < 0. {
                    return Err(Error::InvalidEdgeWeight { from_node: f_id, to_node: t_id, weight: w })
                }
                edges.push((f_id, t_id, w));
                if matches!(edge_type, EdgeType::Undirected) {
                    edges.push((t_id, f_id, w));
                }
                Ok::<(), Error>(())
            })?;

        GraphReader::deduplicate_edges(&mut edges);

        let csr = CSR::construct_with_nodes(vocab.len(), edges);
        let graph = CumCSR::convert(csr);
        info!(nodes = vocab.len(), edges = crate::graph::Graph::edges(&graph), "Loaded graph");

        Ok((vocab, graph))
    }
}

/// Reads node features from tab separated `node_type node_name feat1 feat2 ...` files.
pub struct FeatureReader;

impl FeatureReader {

    fn parse_line(i: usize, line: String) -> Result<(String, String, Vec<String>)> {
        let pieces: Vec<_> = line.split('\t').collect();
        if pieces.len() != 3 {
            return Err(Error::MalformedLine {
                line: i,
                message: "Malformed feature file: Expected 3 fields!".into()
            })
        }
        let feats = pieces[2].split_whitespace().map(|f| f.to_string()).collect();
        Ok((pieces[0].to_string(), pieces[1].to_string(), feats))
    }

    /// Loads features into a store derived from a graph; nodes not present in `node_vocab` are
    /// skipped.  Returns the number of nodes which were updated.
    pub fn load_into(
        path: impl AsRef<Path>,
        features: &mut FeatureStore,
        node_vocab: &Vocab
    ) -> Result<usize> {
        let reader = open_file_for_reading(path)?.lines();
        let rr = RecordReader::new(1_000, 0);
        let mut updated = 0usize;
        let mut skipped = 0usize;
        rr.read(reader,
            |i, line| Some(FeatureReader::parse_line(i, line)),
            |_i, record| {
                let (node_type, name, feats) = record?;
                if let Some(node_id) = node_vocab.get_node_id(&node_type, &name) {
                    features.set_features(node_id, feats);
                    updated += 1;
                } else {
                    skipped += 1;
                }
                Ok::<(), Error>(())
            })?;

        if skipped > 0 {
            warn!(skipped, "Feature file references nodes missing from the graph");
        }
        info!(nodes = updated, features = features.num_features(), "Loaded features");
        Ok(updated)
    }

    /// Loads a feature set independently of any graph, building its own node vocabulary.
    pub fn load(path: impl AsRef<Path>, namespace: &str) -> Result<(Vocab, FeatureStore)> {
        let reader = open_file_for_reading(path)?.lines();
        let rr = RecordReader::new(1_000, 0);
        let mut node_vocab = Vocab::new();
        let mut records = Vec::new();
        rr.read(reader,
            |i, line| Some(FeatureReader::parse_line(i, line)),
            |_i, record| {
                let (node_type, name, feats) = record?;
                let node_id = node_vocab.get_or_insert(&node_type, &name);
                records.push((node_id, feats));
                Ok::<(), Error>(())
            })?;

        let mut features = FeatureStore::new(node_vocab.len(), namespace.to_string());
        for (node_id, feats) in records {
            features.set_features(node_id, feats);
        }
        info!(nodes = node_vocab.len(), features = features.num_features(), "Loaded feature set");
        Ok((node_vocab, features))
    }
}

#[cfg(test)]
mod io_tests {
    use super::*;
    use std::io::Write as _;
    use crate::graph::Graph;

    fn write_file(dir: &tempfile::TempDir, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_embedding_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut vocab = Vocab::new();
        vocab.get_or_insert("feat", "a");
        vocab.get_or_insert("node", "0");
        let es = EmbeddingStore::from_vec(3, vec![0.1, -2.5, 3e-7, 1., 0., -0.333333], Distance::Cosine);

        for name in ["embs", "embs.gz"] {
            let path = dir.path().join(name);
            save_embeddings(&path, &vocab, &es, None).unwrap();

            let (new_vocab, new_es) = EmbeddingReader::load(&path, Distance::Cosine, None, None, None).unwrap();
            assert_eq!(new_vocab.len(), 2);
            assert_eq!(new_vocab.get_name(1), Some(("node", "0")));
            assert_eq!(new_es.dims(), 3);
            assert_eq!(new_es.to_vec(), es.to_vec());
        }
    }

    #[test]
    fn test_embedding_reader_rejects_mixed_dims() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "bad", "f\ta\t[1,2]\nf\tb\t[1,2,3]\n");
        let res = EmbeddingReader::load(&path, Distance::Cosine, None, Some(1), None);
        assert!(matches!(res, Err(Error::DimensionMismatch { expected: 2, found: 3 })));
    }

    #[test]
    fn test_embedding_reader_header_and_filter() {
        let dir = tempfile::tempdir().unwrap();
        let contents = "header\tx\t[0]\n\
                        feat\ta\t[1,2]\n\
                        feature\tz\t[9,9]\n\
                        feat\tb\t[3,4]\n";
        let path = write_file(&dir, "embs", contents);

        for chunk_size in [None, Some(1)] {
            let (vocab, es) = EmbeddingReader::load(
                &path, Distance::Cosine, Some("feat".into()), chunk_size, Some(1)).unwrap();
            assert_eq!(vocab.len(), 2);
            assert_eq!(es.len(), 2);
            let b = vocab.get_node_id("feat", "b").unwrap();
            assert_eq!(es.get_embedding(b), vec![3., 4.]);
            assert!(vocab.get_node_id("feature", "z").is_none());
        }

        // Skipping a row which would have matched the filter
        let path = write_file(&dir, "embs2", "feat\ta\t[1,2]\nfeat\tb\t[3,4]\n");
        let (vocab, es) = EmbeddingReader::load(&path, Distance::Cosine, Some("feat".into()), None, Some(1)).unwrap();
        assert_eq!(vocab.len(), 1);
        assert_eq!(es.to_vec(), vec![3., 4.]);
    }

    #[test]
    fn test_graph_reader() {
        let dir = tempfile::tempdir().unwrap();
        let contents = "from_type\tfrom\tto_type\tto\tweight\n\
                        u\ta\ti\tx\t1\n\
                        u\ta\ti\tx\t2\n\
                        u\tb\ti\tx\t1\n";
        let path = write_file(&dir, "graph", contents);
        let (vocab, graph) = GraphReader::load(&path, EdgeType::Undirected, 2, 1, true).unwrap();
        assert_eq!(vocab.len(), 3);
        assert_eq!(graph.len(), 3);
        // duplicate edges are merged
        assert_eq!(graph.edges(), 4);

        let x = vocab.get_node_id("i", "x").unwrap();
        assert_eq!(graph.degree(x), 2);
        assert_eq!(graph.get_edges(x).1, &[0.75, 1.]);

        let path = write_file(&dir, "bad_graph", "u\ta\ti\tx\t-1\n");
        let res = GraphReader::load(&path, EdgeType::Directed, 1, 0, true);
        assert!(matches!(res, Err(Error::InvalidEdgeWeight { .. })));
    }

    #[test]
    fn test_feature_reader() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "features", "u\ta\tred blue\nu\tzzz\tgreen\ni\tx\tblue\n");

        let mut vocab = Vocab::new();
        vocab.get_or_insert("u", "a");
        vocab.get_or_insert("i", "x");
        let mut fs = FeatureStore::new(2, "feat".into());
        let updated = FeatureReader::load_into(&path, &mut fs, &vocab).unwrap();
        assert_eq!(updated, 2);
        assert_eq!(fs.get_pretty_features(0), vec!["red", "blue"]);
        assert_eq!(fs.get_pretty_features(1), vec!["blue"]);
        assert_eq!(fs.num_features(), 2);

        let (node_vocab, fs) = FeatureReader::load(&path, "feat").unwrap();
        assert_eq!(node_vocab.len(), 3);
        assert_eq!(fs.num_features(), 3);
        assert_eq!(fs.get_pretty_features(1), vec!["green"]);
    }
}
