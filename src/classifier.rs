use log::{info, warn};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::models::{Analysis, Sentiment};
use crate::text::normalize;

/// Words whose presence marks a message as potentially risky.
pub const RISK_KEYWORDS: &[&str] = &[
    "ataque", "odio", "violencia", "armas", "ameaça", "terror", "morte", "extremista", "nazismo",
    "fascismo", "racismo", "genocidio", "propaganda",
];

const POSITIVE_WORDS: &[&str] = &["bom", "ótimo", "excelente", "parabéns", "feliz"];
const NEGATIVE_WORDS: &[&str] = &["ruim", "péssimo", "lixo", "odeio", "triste"];

/// Placeholder labeled sample the risk model is trained on at the start of every
/// analyze run. Far too small for a meaningful model.
pub const TRAINING_SAMPLE: &[(&str, bool)] = &[
    ("Ataque terrorista foi frustrado pela polícia", true),
    ("Ótima notícia, vamos celebrar a paz!", false),
    ("Esse grupo dissemina ódio e preconceito", true),
    ("Reunião de comunidade pacífica", false),
    ("Precisamos combater a violência nas ruas", true),
    ("Hoje o dia está lindo para passear", false),
    ("Propaganda nazista é um crime e deve ser denunciada", true),
    ("Vou comprar pão agora.", false),
];

const MAX_FEATURES: usize = 1000;
const HOLDOUT_FRACTION: f64 = 0.2;
const SMOOTHING_ALPHA: f64 = 1.0;

/// TF-IDF over unigrams and bigrams of normalized tokens.
#[derive(Debug, Clone)]
pub struct TfidfVectorizer {
    vocabulary: HashMap<String, usize>,
    idf: Vec<f64>,
}

impl TfidfVectorizer {
    /// Learn the vocabulary (capped at `max_features` most frequent terms) and
    /// smoothed inverse document frequencies from a corpus of token lists.
    pub fn fit(docs: &[Vec<String>], max_features: usize) -> Self {
        let mut term_freq: HashMap<String, usize> = HashMap::new();
        let mut doc_freq: HashMap<String, usize> = HashMap::new();
        for doc in docs {
            let terms = ngrams(doc);
            let mut seen = HashSet::new();
            for term in terms {
                *term_freq.entry(term.clone()).or_default() += 1;
                if seen.insert(term.clone()) {
                    *doc_freq.entry(term).or_default() += 1;
                }
            }
        }

        // Most frequent first, ties broken alphabetically so the cut is stable.
        let mut ranked: Vec<(String, usize)> = term_freq.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(max_features);
        let mut kept: Vec<String> = ranked.into_iter().map(|(term, _)| term).collect();
        kept.sort();

        let n_docs = docs.len() as f64;
        let idf = kept
            .iter()
            .map(|term| {
                let df = doc_freq.get(term).copied().unwrap_or(0) as f64;
                ((1.0 + n_docs) / (1.0 + df)).ln() + 1.0
            })
            .collect();
        let vocabulary = kept.into_iter().enumerate().map(|(i, term)| (term, i)).collect();

        Self { vocabulary, idf }
    }

    pub fn n_features(&self) -> usize {
        self.idf.len()
    }

    /// Map tokens to an L2-normalized TF-IDF row. Unknown terms are ignored.
    pub fn transform(&self, tokens: &[String]) -> Vec<f64> {
        let mut row = vec![0.0; self.n_features()];
        for term in ngrams(tokens) {
            if let Some(&idx) = self.vocabulary.get(&term) {
                row[idx] += 1.0;
            }
        }
        for (value, idf) in row.iter_mut().zip(&self.idf) {
            *value *= idf;
        }
        let norm = row.iter().map(|v| v * v).sum::<f64>().sqrt();
        if norm > 0.0 {
            for value in row.iter_mut() {
                *value /= norm;
            }
        }
        row
    }
}

fn ngrams(tokens: &[String]) -> Vec<String> {
    let mut terms: Vec<String> = tokens.to_vec();
    terms.extend(tokens.windows(2).map(|pair| format!("{} {}", pair[0], pair[1])));
    terms
}

/// Two-class multinomial Naive Bayes with additive smoothing.
#[derive(Debug, Clone)]
pub struct MultinomialNb {
    // Index 0 is "not risky", index 1 is "risky".
    class_log_prior: [f64; 2],
    feature_log_prob: [Vec<f64>; 2],
}

impl MultinomialNb {
    pub fn fit(rows: &[Vec<f64>], labels: &[bool], alpha: f64) -> Self {
        let n_features = rows.first().map(Vec::len).unwrap_or(0);
        let mut class_count = [0usize; 2];
        let mut feature_count = [vec![0.0; n_features], vec![0.0; n_features]];
        for (row, &label) in rows.iter().zip(labels) {
            let class = label as usize;
            class_count[class] += 1;
            for (total, value) in feature_count[class].iter_mut().zip(row) {
                *total += value;
            }
        }

        let n_rows = class_count[0] + class_count[1];
        let class_log_prior =
            class_count.map(|count| (count as f64 / n_rows.max(1) as f64).ln());
        let feature_log_prob = feature_count.map(|counts| {
            let denominator = counts.iter().sum::<f64>() + alpha * n_features as f64;
            counts
                .iter()
                .map(|c| ((c + alpha) / denominator).ln())
                .collect::<Vec<f64>>()
        });

        Self {
            class_log_prior,
            feature_log_prob,
        }
    }

    /// True when the "risky" class has the strictly higher joint log likelihood.
    pub fn predict(&self, row: &[f64]) -> bool {
        let [not_risky, risky] = [0usize, 1].map(|class| {
            self.class_log_prior[class]
                + self.feature_log_prob[class]
                    .iter()
                    .zip(row)
                    .map(|(log_prob, x)| log_prob * x)
                    .sum::<f64>()
        });
        risky > not_risky
    }
}

/// How the risk flag is decided for one analyze run.
#[derive(Debug, Clone)]
pub enum RiskDetector {
    TrainedModel {
        vectorizer: TfidfVectorizer,
        model: MultinomialNb,
    },
    KeywordFallback {
        keywords: HashSet<String>,
    },
}

impl RiskDetector {
    /// Train on a labeled sample. Falls back to keyword matching when the sample
    /// holds fewer than two label classes or yields no features.
    pub fn train(samples: &[(&str, bool)]) -> Self {
        let classes: HashSet<bool> = samples.iter().map(|(_, label)| *label).collect();
        if classes.len() < 2 {
            warn!("Training sample has fewer than two label classes; using keyword fallback");
            return Self::keyword_fallback();
        }

        let docs: Vec<Vec<String>> = samples.iter().map(|&(text, _)| normalize(Some(text))).collect();
        let labels: Vec<bool> = samples.iter().map(|(_, label)| *label).collect();
        let (train_idx, test_idx) = stratified_split(&labels, HOLDOUT_FRACTION);

        let train_docs: Vec<Vec<String>> = train_idx.iter().map(|&i| docs[i].clone()).collect();
        let vectorizer = TfidfVectorizer::fit(&train_docs, MAX_FEATURES);
        if vectorizer.n_features() == 0 {
            warn!("Training sample produced an empty vocabulary; using keyword fallback");
            return Self::keyword_fallback();
        }

        let rows: Vec<Vec<f64>> = train_docs.iter().map(|doc| vectorizer.transform(doc)).collect();
        let train_labels: Vec<bool> = train_idx.iter().map(|&i| labels[i]).collect();
        let model = MultinomialNb::fit(&rows, &train_labels, SMOOTHING_ALPHA);
        info!(
            "Risk model trained on {} rows with {} features",
            train_idx.len(),
            vectorizer.n_features()
        );

        let detector = Self::TrainedModel { vectorizer, model };
        if !test_idx.is_empty() {
            let predicted: Vec<bool> = test_idx.iter().map(|&i| detector.is_risky(&docs[i])).collect();
            let expected: Vec<bool> = test_idx.iter().map(|&i| labels[i]).collect();
            log_holdout_report(&expected, &predicted);
        }
        detector
    }

    pub fn keyword_fallback() -> Self {
        Self::KeywordFallback {
            keywords: RISK_KEYWORDS.iter().map(|kw| kw.to_string()).collect(),
        }
    }

    pub fn is_trained(&self) -> bool {
        matches!(self, Self::TrainedModel { .. })
    }

    pub fn is_risky(&self, tokens: &[String]) -> bool {
        match self {
            Self::TrainedModel { vectorizer, model } => model.predict(&vectorizer.transform(tokens)),
            Self::KeywordFallback { keywords } => tokens.iter().any(|t| keywords.contains(t)),
        }
    }
}

/// Hold out the last `fraction` (rounded up) of each class, keeping at least one
/// training row per class.
fn stratified_split(labels: &[bool], fraction: f64) -> (Vec<usize>, Vec<usize>) {
    let mut by_class: BTreeMap<bool, Vec<usize>> = BTreeMap::new();
    for (i, &label) in labels.iter().enumerate() {
        by_class.entry(label).or_default().push(i);
    }

    let mut train = Vec::new();
    let mut test = Vec::new();
    for indices in by_class.values() {
        let n_test = if indices.len() > 1 {
            ((indices.len() as f64 * fraction).ceil() as usize).min(indices.len() - 1)
        } else {
            0
        };
        let (kept, held_out) = indices.split_at(indices.len() - n_test);
        train.extend_from_slice(kept);
        test.extend_from_slice(held_out);
    }
    train.sort_unstable();
    test.sort_unstable();
    (train, test)
}

fn log_holdout_report(expected: &[bool], predicted: &[bool]) {
    let correct = expected.iter().zip(predicted).filter(|(e, p)| e == p).count();
    info!(
        "Risk model held-out accuracy: {}/{} ({:.2})",
        correct,
        expected.len(),
        correct as f64 / expected.len() as f64
    );
    for class in [true, false] {
        let true_pos = expected
            .iter()
            .zip(predicted)
            .filter(|(e, p)| **e == class && **p == class)
            .count();
        let predicted_pos = predicted.iter().filter(|p| **p == class).count();
        let actual_pos = expected.iter().filter(|e| **e == class).count();
        let precision = if predicted_pos > 0 { true_pos as f64 / predicted_pos as f64 } else { 0.0 };
        let recall = if actual_pos > 0 { true_pos as f64 / actual_pos as f64 } else { 0.0 };
        info!(
            "  {:<9} precision={:.2} recall={:.2} support={}",
            if class { "risk" } else { "not_risk" },
            precision,
            recall,
            actual_pos
        );
    }
}

/// Risk keywords present in `tokens`, in keyword-list order. `None` when there are none.
pub fn extract_keywords(tokens: &[String]) -> Option<Vec<String>> {
    let found: Vec<String> = RISK_KEYWORDS
        .iter()
        .filter(|kw| tokens.iter().any(|t| t == *kw))
        .map(|kw| kw.to_string())
        .collect();
    if found.is_empty() {
        None
    } else {
        Some(found)
    }
}

/// Majority vote between positive and negative word hits; ties are neutral.
pub fn classify_sentiment(tokens: &[String]) -> Sentiment {
    let positive = tokens.iter().filter(|t| POSITIVE_WORDS.contains(&t.as_str())).count();
    let negative = tokens.iter().filter(|t| NEGATIVE_WORDS.contains(&t.as_str())).count();
    match positive.cmp(&negative) {
        std::cmp::Ordering::Greater => Sentiment::Positive,
        std::cmp::Ordering::Less => Sentiment::Negative,
        std::cmp::Ordering::Equal => Sentiment::Neutral,
    }
}

/// Everything the analyze pass needs to annotate a message.
pub struct Classifier {
    detector: RiskDetector,
}

impl Classifier {
    pub fn new(detector: RiskDetector) -> Self {
        Self { detector }
    }

    pub fn detector(&self) -> &RiskDetector {
        &self.detector
    }

    pub fn analyze(&self, text: Option<&str>) -> Analysis {
        let tokens = normalize(text);
        Analysis {
            is_risk: self.detector.is_risky(&tokens),
            sentiment: classify_sentiment(&tokens),
            keywords: extract_keywords(&tokens),
        }
    }
}
