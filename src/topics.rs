//! Topic hierarchy derived from document vectors.
//!
//! [`TopicHierarchyBuilder`] clusters documents recursively with spherical
//! k-means and names every cluster after its most distinctive terms.
//! [`TopicService`] publishes built trees as immutable snapshots.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::{
    cache::ResultCache,
    config::TopicSettings,
    config_db::ConfigDb,
    embedding::{cosine, normalize},
    error::{Error, Result},
    events::{EventBus, TopicTreeUpdated},
    model_registry::ModelRegistry,
    store::IndexStore,
    text_util::lowercase_words,
};

pub const TOPIC_TREE_KEY: &str = "topic_tree";

/// Words too common to name a topic.
const STOP_WORDS: &[&str] = &[
    "about", "after", "also", "and", "are", "because", "been", "before", "being",
    "but", "can", "could", "did", "does", "each", "for", "from", "had", "has",
    "have", "her", "his", "how", "into", "its", "just", "more", "most", "not",
    "only", "other", "our", "over", "she", "should", "some", "such", "than",
    "that", "the", "their", "them", "then", "there", "these", "they", "this",
    "those", "through", "under", "very", "was", "were", "what", "when", "where",
    "which", "while", "who", "why", "will", "with", "would", "you", "your",
];

const MIN_TERM_LEN: usize = 3;
const MAX_SLUG_LEN: usize = 48;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicNode {
    pub name: String,
    /// `/`-joined names from the root.
    pub path: String,
    pub children: Vec<TopicNode>,
    /// Documents in this subtree.
    pub document_count: usize,
    pub relevance_score: f32,
    /// Documents assigned directly to this node.
    pub document_ids: Vec<String>,
}

impl TopicNode {
    fn count_nodes(&self) -> usize {
        1 + self.children.iter().map(TopicNode::count_nodes).sum::<usize>()
    }

    fn collect_assignments(&self, out: &mut BTreeMap<String, String>) {
        for id in &self.document_ids {
            out.insert(id.clone(), self.path.clone());
        }
        for child in &self.children {
            child.collect_assignments(out);
        }
    }

    fn find(&self, path: &str) -> Option<&TopicNode> {
        if self.path == path {
            return Some(self);
        }
        if !is_within(path, &self.path) {
            return None;
        }
        self.children.iter().find_map(|c| c.find(path))
    }

    /// Depth of the deepest node below and including this one.
    pub fn depth(&self) -> usize {
        1 + self.children.iter().map(TopicNode::depth).max().unwrap_or(0)
    }
}

/// An immutable snapshot of the topic hierarchy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicTree {
    pub roots: Vec<TopicNode>,
    pub total_topics: usize,
    pub generated_at: DateTime<Utc>,
    pub generation: u64,
    /// Document id to the path of the node holding it.
    pub assignments: BTreeMap<String, String>,
}

impl TopicTree {
    pub fn empty() -> Self {
        Self {
            roots: Vec::new(),
            total_topics: 0,
            generated_at: Utc::now(),
            generation: 0,
            assignments: BTreeMap::new(),
        }
    }

    fn from_roots(roots: Vec<TopicNode>) -> Self {
        let mut assignments = BTreeMap::new();
        for root in &roots {
            root.collect_assignments(&mut assignments);
        }
        Self {
            total_topics: roots.iter().map(TopicNode::count_nodes).sum(),
            roots,
            generated_at: Utc::now(),
            generation: 0,
            assignments,
        }
    }

    pub fn find(&self, path: &str) -> Option<&TopicNode> {
        let path = path.trim_matches('/');
        self.roots.iter().find_map(|r| r.find(path))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.find(path).is_some()
    }

    pub fn topic_of(&self, document_id: &str) -> Option<&str> {
        self.assignments.get(document_id).map(String::as_str)
    }

    pub fn depth(&self) -> usize {
        self.roots.iter().map(TopicNode::depth).max().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

/// Whether `path` is `topic` or lies below it.
pub fn is_within(path: &str, topic: &str) -> bool {
    path == topic
        || path
            .strip_prefix(topic)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// One document as seen by the builder.
#[derive(Debug, Clone)]
pub struct TopicInput {
    pub doc_id: String,
    pub title: String,
    pub vector: Vec<f32>,
    /// A sample of the document text used for naming.
    pub text: String,
}

/// Term statistics shared by every level of one build.
struct Corpus {
    ids: Vec<String>,
    vectors: Vec<Vec<f32>>,
    terms: Vec<HashMap<String, u32>>,
    document_frequency: HashMap<String, usize>,
}

impl Corpus {
    fn new(inputs: &[TopicInput]) -> Self {
        let dimension = inputs.first().map_or(0, |i| i.vector.len());
        let inputs: Vec<&TopicInput> = inputs
            .iter()
            .filter(|i| i.vector.len() == dimension && dimension > 0)
            .collect();

        let mut document_frequency: HashMap<String, usize> = HashMap::new();
        let terms: Vec<HashMap<String, u32>> = inputs
            .iter()
            .map(|input| {
                let mut counts: HashMap<String, u32> = HashMap::new();
                let text = format!("{} {}", input.title, input.text);
                for word in lowercase_words(&text) {
                    if is_label_word(&word) {
                        *counts.entry(word).or_default() += 1;
                    }
                }
                for word in counts.keys() {
                    *document_frequency.entry(word.clone()).or_default() += 1;
                }
                counts
            })
            .collect();

        Self {
            ids: inputs.iter().map(|i| i.doc_id.clone()).collect(),
            vectors: inputs
                .iter()
                .map(|i| {
                    let mut v = i.vector.clone();
                    normalize(&mut v);
                    v
                })
                .collect(),
            terms,
            document_frequency,
        }
    }

    fn len(&self) -> usize {
        self.ids.len()
    }

    fn points(&self, members: &[usize]) -> Vec<&[f32]> {
        members.iter().map(|&m| self.vectors[m].as_slice()).collect()
    }

    /// Top terms of a cluster by cluster share times inverse corpus frequency.
    fn label(&self, members: &[usize], count: usize) -> Vec<String> {
        let total = self.len() as f32;
        let mut cluster_df: HashMap<&str, usize> = HashMap::new();
        for &member in members {
            for word in self.terms[member].keys() {
                *cluster_df.entry(word.as_str()).or_default() += 1;
            }
        }
        let mut scored: Vec<(f32, &str)> = cluster_df
            .into_iter()
            .map(|(word, df)| {
                let corpus_df = self.document_frequency.get(word).copied().unwrap_or(1);
                let share = df as f32 / members.len() as f32;
                (share * (1.0 + total / corpus_df as f32).ln(), word)
            })
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(b.1)));
        scored
            .into_iter()
            .take(count)
            .map(|(_, w)| w.to_string())
            .collect()
    }
}

fn is_label_word(word: &str) -> bool {
    word.chars().count() >= MIN_TERM_LEN
        && !word.chars().all(|c| c.is_ascii_digit())
        && !STOP_WORDS.contains(&word)
}

/// Lower-case `[a-z0-9-]` form of a name; empty when nothing survives.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    let mut slug = slug.trim_end_matches('-').to_string();
    if slug.len() > MAX_SLUG_LEN {
        slug.truncate(MAX_SLUG_LEN);
        slug = slug.trim_end_matches('-').to_string();
    }
    slug
}

/// Builds [`TopicTree`]s from document vectors.
#[derive(Debug, Clone)]
pub struct TopicHierarchyBuilder {
    settings: TopicSettings,
}

impl TopicHierarchyBuilder {
    pub fn new(settings: TopicSettings) -> Self {
        Self { settings }
    }

    /// Cluster `inputs` into a hierarchy.
    ///
    /// `cancel` is checked before every node is built. Inputs whose vector
    /// dimension differs from the first input are left out.
    pub fn generate(
        &self,
        inputs: &[TopicInput],
        cancel: &watch::Receiver<bool>,
    ) -> Result<TopicTree> {
        let corpus = Corpus::new(inputs);
        if corpus.len() == 0 {
            return Ok(TopicTree::empty());
        }
        let all: Vec<usize> = (0..corpus.len()).collect();

        let clusters = if self.splittable(all.len()) {
            self.top_level_clusters(&corpus, &all)
        } else {
            vec![all.clone()]
        };
        let roots = if clusters.len() > 1 {
            self.build_children(&corpus, clusters, "", 1, cancel)?
        } else {
            let name = self.name(&corpus, &all, 0);
            vec![self.build_node(&corpus, &all, name, String::new(), 1, cancel)?]
        };

        let tree = TopicTree::from_roots(roots);
        tracing::debug!(
            documents = corpus.len(),
            topics = tree.total_topics,
            depth = tree.depth(),
            "topic hierarchy built"
        );
        Ok(tree)
    }

    fn splittable(&self, size: usize) -> bool {
        size >= 2 * self.settings.min_cluster_size.max(1)
    }

    fn build_node(
        &self,
        corpus: &Corpus,
        members: &[usize],
        name: String,
        parent: String,
        depth: usize,
        cancel: &watch::Receiver<bool>,
    ) -> Result<TopicNode> {
        if *cancel.borrow() {
            return Err(Error::Cancelled);
        }
        let path = if parent.is_empty() {
            name.clone()
        } else {
            format!("{parent}/{name}")
        };
        let relevance_score = coherence(corpus, members);

        let mut clusters: Vec<Vec<usize>> = Vec::new();
        if depth < self.settings.max_depth && self.splittable(members.len()) {
            let points = corpus.points(members);
            let (_, found) = spherical_kmeans(
                &points,
                &vec![1.0; points.len()],
                self.settings.branching_factor,
                self.settings.max_iterations,
            );
            clusters = found
                .into_iter()
                .map(|cluster| cluster.into_iter().map(|i| members[i]).collect())
                .collect();
        }

        if clusters.len() <= 1 {
            let mut document_ids: Vec<String> =
                members.iter().map(|&m| corpus.ids[m].clone()).collect();
            document_ids.sort();
            return Ok(TopicNode {
                name,
                path,
                children: Vec::new(),
                document_count: document_ids.len(),
                relevance_score,
                document_ids,
            });
        }

        let children = self.build_children(corpus, clusters, &path, depth + 1, cancel)?;
        Ok(TopicNode {
            name,
            path,
            document_count: children.iter().map(|c| c.document_count).sum(),
            children,
            relevance_score,
            document_ids: Vec::new(),
        })
    }

    /// Name sibling clusters uniquely and build them in parallel.
    fn build_children(
        &self,
        corpus: &Corpus,
        mut clusters: Vec<Vec<usize>>,
        parent: &str,
        depth: usize,
        cancel: &watch::Receiver<bool>,
    ) -> Result<Vec<TopicNode>> {
        clusters.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

        let mut taken = HashSet::new();
        let named: Vec<(String, Vec<usize>)> = clusters
            .into_iter()
            .enumerate()
            .map(|(index, members)| {
                let base = self.name(corpus, &members, index);
                let mut name = base.clone();
                let mut suffix = 2;
                while !taken.insert(name.clone()) {
                    name = format!("{base}-{suffix}");
                    suffix += 1;
                }
                (name, members)
            })
            .collect();

        named
            .into_par_iter()
            .map(|(name, members)| {
                self.build_node(corpus, &members, name, parent.to_string(), depth, cancel)
            })
            .collect()
    }

    fn name(&self, corpus: &Corpus, members: &[usize], index: usize) -> String {
        let terms = corpus.label(members, self.settings.label_terms.max(1));
        let slug = slugify(&terms.join(" "));
        if slug.is_empty() {
            format!("topic-{}", index + 1)
        } else {
            slug
        }
    }

    /// First-level clusters; large corpora are clustered per partition and
    /// the partition centroids merged.
    fn top_level_clusters(&self, corpus: &Corpus, all: &[usize]) -> Vec<Vec<usize>> {
        let k = self.settings.branching_factor;
        let iterations = self.settings.max_iterations;
        let partition_size = self.settings.partition_size.max(k.max(1));

        if all.len() <= partition_size {
            let points = corpus.points(all);
            return spherical_kmeans(&points, &vec![1.0; points.len()], k, iterations).1;
        }

        let partial: Vec<(Vec<f32>, f32)> = all
            .par_chunks(partition_size)
            .flat_map_iter(|partition| {
                let points = corpus.points(partition);
                let (centroids, clusters) =
                    spherical_kmeans(&points, &vec![1.0; points.len()], k, iterations);
                centroids
                    .into_iter()
                    .zip(clusters)
                    .map(|(centroid, members)| (centroid, members.len() as f32))
                    .collect::<Vec<_>>()
            })
            .collect();

        let points: Vec<&[f32]> = partial.iter().map(|(c, _)| c.as_slice()).collect();
        let weights: Vec<f32> = partial.iter().map(|(_, w)| *w).collect();
        let (merged, _) = spherical_kmeans(&points, &weights, k, iterations);

        let assignment: Vec<usize> = all
            .par_iter()
            .map(|&i| nearest(&merged, &corpus.vectors[i]))
            .collect();
        let mut clusters = vec![Vec::new(); merged.len()];
        for (&doc, &cluster) in all.iter().zip(&assignment) {
            clusters[cluster].push(doc);
        }
        clusters.retain(|c| !c.is_empty());
        tracing::debug!(
            partitions = all.len().div_ceil(partition_size),
            clusters = clusters.len(),
            "merged partition clusters"
        );
        clusters
    }
}

/// Mean cosine of `members` to their centroid, clamped to [0, 1].
fn coherence(corpus: &Corpus, members: &[usize]) -> f32 {
    if members.is_empty() {
        return 0.0;
    }
    let points = corpus.points(members);
    let all: Vec<usize> = (0..points.len()).collect();
    let centroid = weighted_mean(&points, &vec![1.0; points.len()], &all);
    let total: f32 = points.iter().map(|p| cosine(p, &centroid)).sum();
    (total / members.len() as f32).clamp(0.0, 1.0)
}

fn nearest<C: AsRef<[f32]>>(centroids: &[C], point: &[f32]) -> usize {
    let mut best = 0;
    let mut best_sim = f32::NEG_INFINITY;
    for (i, c) in centroids.iter().enumerate() {
        let sim = cosine(point, c.as_ref());
        if sim > best_sim {
            best = i;
            best_sim = sim;
        }
    }
    best
}

/// Unit-length weighted mean of the selected points.
fn weighted_mean(points: &[&[f32]], weights: &[f32], selected: &[usize]) -> Vec<f32> {
    let dimension = points.first().map_or(0, |p| p.len());
    let mut sum = vec![0f32; dimension];
    for &i in selected {
        for (acc, x) in sum.iter_mut().zip(points[i]) {
            *acc += x * weights[i];
        }
    }
    normalize(&mut sum);
    sum
}

/// Weighted spherical k-means with farthest-point initialization.
///
/// The first centre is the point nearest the overall mean; each next one
/// is the point farthest from all chosen centres. Returns the centroids
/// of non-empty clusters and their member indices.
fn spherical_kmeans(
    points: &[&[f32]],
    weights: &[f32],
    k: usize,
    max_iterations: usize,
) -> (Vec<Vec<f32>>, Vec<Vec<usize>>) {
    if points.is_empty() || k == 0 {
        return (Vec::new(), Vec::new());
    }
    let all: Vec<usize> = (0..points.len()).collect();
    let mean = weighted_mean(points, weights, &all);

    let first = nearest(points, &mean);
    let mut centroids = vec![points[first].to_vec()];
    let mut closest: Vec<f32> = points.iter().map(|p| cosine(p, &centroids[0])).collect();
    while centroids.len() < k.min(points.len()) {
        let Some((far, sim)) = closest
            .iter()
            .copied()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(&b.1))
        else {
            break;
        };
        // the rest coincide with a centre
        if sim >= 1.0 - 1e-6 {
            break;
        }
        let centre = points[far].to_vec();
        for (best, p) in closest.iter_mut().zip(points) {
            *best = best.max(cosine(p, &centre));
        }
        centroids.push(centre);
    }

    let mut assignment = vec![usize::MAX; points.len()];
    for _ in 0..max_iterations.max(1) {
        let next: Vec<usize> = points.iter().map(|p| nearest(&centroids, p)).collect();
        if next == assignment {
            break;
        }
        assignment = next;
        for (c, centroid) in centroids.iter_mut().enumerate() {
            let members: Vec<usize> = all.iter().copied().filter(|&i| assignment[i] == c).collect();
            if !members.is_empty() {
                *centroid = weighted_mean(points, weights, &members);
            }
        }
    }

    let mut clusters = vec![Vec::new(); centroids.len()];
    for (i, &c) in assignment.iter().enumerate() {
        clusters[c].push(i);
    }
    centroids
        .into_iter()
        .zip(clusters)
        .filter(|(_, members)| !members.is_empty())
        .unzip()
}

/// Publishes topic trees and keeps document assignments in the store.
pub struct TopicService {
    tree: RwLock<Arc<TopicTree>>,
    /// Held across build, store assignment and publication.
    regenerating: Mutex<()>,
    builder: TopicHierarchyBuilder,
    settings: TopicSettings,
    store: Arc<dyn IndexStore>,
    registry: Arc<ModelRegistry>,
    cache: Arc<ResultCache>,
    events: Arc<EventBus>,
    config_db: Option<Arc<ConfigDb>>,
}

impl TopicService {
    /// Restores the last persisted tree when `config_db` holds one.
    pub fn new(
        settings: TopicSettings,
        store: Arc<dyn IndexStore>,
        registry: Arc<ModelRegistry>,
        cache: Arc<ResultCache>,
        events: Arc<EventBus>,
        config_db: Option<Arc<ConfigDb>>,
    ) -> Result<Self> {
        let tree = match &config_db {
            Some(db) => match db.get_setting(TOPIC_TREE_KEY)? {
                Some(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "discarding unreadable topic tree");
                    TopicTree::empty()
                }),
                None => TopicTree::empty(),
            },
            None => TopicTree::empty(),
        };
        Ok(Self {
            tree: RwLock::new(Arc::new(tree)),
            regenerating: Mutex::new(()),
            builder: TopicHierarchyBuilder::new(settings.clone()),
            settings,
            store,
            registry,
            cache,
            events,
            config_db,
        })
    }

    pub fn tree(&self) -> Arc<TopicTree> {
        Arc::clone(&self.tree.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn enabled(&self) -> bool {
        self.settings.enabled
    }

    /// Build a tree from the current model's vectors and publish it.
    ///
    /// Nothing changes unless the build succeeds. Concurrent calls run one
    /// after the other, so stored topic paths always match the published
    /// tree.
    pub fn regenerate(&self, cancel: &watch::Receiver<bool>) -> Result<Arc<TopicTree>> {
        if !self.settings.enabled {
            return Err(Error::InvalidOptions("topic generation is disabled".into()));
        }
        let _regenerating = self
            .regenerating
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let model = self.registry.current();
        let inputs = self.inputs(&model)?;
        let mut tree = self.builder.generate(&inputs, cancel)?;
        if *cancel.borrow() {
            return Err(Error::Cancelled);
        }

        self.store.set_topic_paths(&tree.assignments)?;

        let published = {
            let mut guard = self.tree.write().unwrap_or_else(PoisonError::into_inner);
            tree.generation = guard.generation + 1;
            let published = Arc::new(tree);
            *guard = Arc::clone(&published);
            published
        };

        if let Some(db) = &self.config_db
            && let Err(e) = serde_json::to_string(published.as_ref())
                .map_err(Error::from)
                .and_then(|json| db.set_setting(TOPIC_TREE_KEY, &json))
        {
            tracing::warn!(error = %e, "failed to persist topic tree");
        }
        self.cache.invalidate_all();
        self.events.topics.publish(TopicTreeUpdated {
            generation: published.generation,
            generated_at: published.generated_at,
            total_topics: published.total_topics,
        });
        tracing::info!(
            model,
            documents = inputs.len(),
            topics = published.total_topics,
            generation = published.generation,
            "topic hierarchy published"
        );
        Ok(published)
    }

    fn inputs(&self, model: &str) -> Result<Vec<TopicInput>> {
        let vectors = self.store.vectors_for_model(model)?;
        let ids: Vec<String> = vectors.iter().map(|(id, _)| id.clone()).collect();
        let infos = self.store.documents(&ids)?;

        let mut inputs = Vec::with_capacity(vectors.len());
        for (doc_id, vector) in vectors {
            let Some(info) = infos.get(&doc_id) else {
                continue;
            };
            let text = self
                .store
                .page_text(&doc_id, info.first_page)?
                .unwrap_or_default();
            inputs.push(TopicInput {
                title: info.title.clone(),
                doc_id,
                vector,
                text,
            });
        }
        inputs.sort_by(|a, b| a.doc_id.cmp(&b.doc_id));
        Ok(inputs)
    }
}

impl std::fmt::Debug for TopicService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tree = self.tree();
        f.debug_struct("TopicService")
            .field("generation", &tree.generation)
            .field("total_topics", &tree.total_topics)
            .finish_non_exhaustive()
    }
}
