use crate::models::{DatasetSourceKind, Framework, ModelArchitecture, TaskType};
use crate::{ForgeError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use validator::Validate;

/// Default dataset size cap in GB when the utterance carries no size phrase.
pub const DEFAULT_MAX_DATASET_SIZE_GB: f64 = 50.0;

/// The validated structured record produced from one user utterance.
///
/// This is the only carrier between human language and the pipeline. Fields
/// the model omits take defaults; fields outside the schema are discarded by
/// serde before validation runs.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct Plan {
    #[serde(default)]
    #[validate(length(min = 3, max = 80))]
    pub name: String,

    #[serde(default)]
    pub task_type: TaskType,

    #[serde(default)]
    pub framework: Framework,

    #[serde(default)]
    pub dataset_source: DatasetSourceKind,

    #[serde(default)]
    #[validate(length(min = 1, max = 8))]
    pub search_keywords: Vec<String>,

    #[serde(default)]
    pub preferred_model: ModelArchitecture,

    #[serde(default = "default_target_metric")]
    pub target_metric: String,

    #[serde(default = "default_target_value")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub target_value: f64,

    #[serde(default = "default_max_dataset_size_gb")]
    #[validate(range(min = 0.000001))]
    pub max_dataset_size_gb: f64,
}

fn default_target_metric() -> String {
    "accuracy".to_string()
}

fn default_target_value() -> f64 {
    0.9
}

fn default_max_dataset_size_gb() -> f64 {
    DEFAULT_MAX_DATASET_SIZE_GB
}

impl Plan {
    /// Parse raw model output into a validated plan.
    ///
    /// The utterance supplies the fallback name and always wins for the size
    /// cap: an explicit "under X MB/GB" phrase overrides whatever the model
    /// put into `max_dataset_size_gb`.
    pub fn from_llm_output(raw: &str, utterance: &str) -> Result<Plan> {
        let json = extract_json_object(raw).ok_or_else(|| ForgeError::PlanInvalid {
            detail: "output contained no JSON object".to_string(),
        })?;
        let mut plan: Plan = serde_json::from_str(json).map_err(|e| ForgeError::PlanInvalid {
            detail: format!("output is not valid plan JSON: {e}"),
        })?;
        plan.normalize(utterance);
        plan.validate().map_err(|e| ForgeError::PlanInvalid {
            detail: format!("plan failed schema validation: {e}"),
        })?;
        Ok(plan)
    }

    fn normalize(&mut self, utterance: &str) {
        self.search_keywords = self
            .search_keywords
            .iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        self.search_keywords.dedup();
        self.search_keywords.truncate(8);

        self.name = self.name.trim().to_string();
        if self.name.is_empty() {
            self.name = derive_title(utterance);
        } else if self.name.len() > 80 {
            self.name.truncate(floor_char_boundary(&self.name, 80));
            self.name = self.name.trim_end().to_string();
        }

        self.target_metric = self.target_metric.trim().to_lowercase();
        if self.target_metric.is_empty() {
            self.target_metric = default_target_metric();
        }

        if let Some(size) = parse_size_hint(utterance) {
            self.max_dataset_size_gb = size;
        }
    }
}

/// Pull the first balanced `{ … }` block out of model output, tolerating
/// markdown code fences around it.
fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, c) in raw[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[start..start + offset + c.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// First ≤60 characters of the cleaned-up utterance, cut at a word boundary.
pub fn derive_title(utterance: &str) -> String {
    let collapsed: String = utterance.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.len() <= 60 {
        return collapsed;
    }
    let limit = floor_char_boundary(&collapsed, 60);
    let cut = collapsed[..limit].rfind(' ').unwrap_or(limit);
    collapsed[..cut].trim_end().to_string()
}

static SIZE_HINT_RE: OnceLock<Regex> = OnceLock::new();
static SIZE_SUFFIX_RE: OnceLock<Regex> = OnceLock::new();

/// Extract a dataset size cap in GB from phrases like "under 500MB",
/// "max 2 GB", "not more than 1.5GB", "up to 800 megabytes", or
/// "2GB or less". Decimal units divide by 1000, binary units by 1024.
pub fn parse_size_hint(utterance: &str) -> Option<f64> {
    let leading = SIZE_HINT_RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(?:under|below|less than|at most|not more than|no more than|up to|within|max(?:imum)?(?:\s+of)?)\s*:?\s*([0-9]+(?:\.[0-9]+)?)\s*(gib|gigabytes?|gigs?|gb|mib|megabytes?|megs?|mb)\b",
        )
        .expect("size hint regex must compile")
    });
    let trailing = SIZE_SUFFIX_RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b([0-9]+(?:\.[0-9]+)?)\s*(gib|gigabytes?|gigs?|gb|mib|megabytes?|megs?|mb)\s+(?:or\s+less|or\s+smaller|max(?:imum)?|at\s+most|tops)\b",
        )
        .expect("size suffix regex must compile")
    });

    let captures = leading
        .captures(utterance)
        .or_else(|| trailing.captures(utterance))?;
    let value: f64 = captures.get(1)?.as_str().parse().ok()?;
    let unit = captures.get(2)?.as_str().to_lowercase();
    let gb = match unit.as_str() {
        "gb" | "gigabyte" | "gigabytes" | "gig" | "gigs" => value,
        "gib" => value,
        "mb" | "megabyte" | "megabytes" | "meg" | "megs" => value / 1000.0,
        "mib" => value / 1024.0,
        _ => return None,
    };
    (gb > 0.0).then_some(gb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_hint_units_convert() {
        assert_eq!(parse_size_hint("dataset under 500MB"), Some(0.5));
        assert_eq!(parse_size_hint("not more than 1GB please"), Some(1.0));
        assert_eq!(parse_size_hint("up to 2.5 GB of images"), Some(2.5));
        assert_eq!(parse_size_hint("max 800 megabytes"), Some(0.8));
        assert_eq!(parse_size_hint("keep it within 512 MiB"), Some(0.5));
        assert_eq!(parse_size_hint("2GB or less"), Some(2.0));
    }

    #[test]
    fn size_hint_is_idempotent() {
        let utterance = "Train a flower classifier with dataset not more than 1GB";
        assert_eq!(parse_size_hint(utterance), parse_size_hint(utterance));
        assert_eq!(parse_size_hint(utterance), Some(1.0));
    }

    #[test]
    fn size_hint_absent_means_none() {
        assert_eq!(parse_size_hint("train a flower classifier"), None);
        assert_eq!(parse_size_hint("use 3 classes"), None);
    }

    #[test]
    fn plan_parses_with_defaults() {
        let raw = r#"{"search_keywords": ["Flower", " classifier "]}"#;
        let plan = Plan::from_llm_output(raw, "Train a flower classifier").unwrap();
        assert_eq!(plan.name, "Train a flower classifier");
        assert_eq!(plan.task_type, TaskType::ImageClassification);
        assert_eq!(plan.framework, Framework::Pytorch);
        assert_eq!(plan.dataset_source, DatasetSourceKind::Kaggle);
        assert_eq!(plan.preferred_model, ModelArchitecture::Resnet18);
        assert_eq!(plan.target_metric, "accuracy");
        assert_eq!(plan.target_value, 0.9);
        assert_eq!(plan.max_dataset_size_gb, DEFAULT_MAX_DATASET_SIZE_GB);
        assert_eq!(plan.search_keywords, vec!["flower", "classifier"]);
    }

    #[test]
    fn plan_discards_unknown_fields() {
        let raw = r#"{"search_keywords":["cats"],"banana":42,"nested":{"x":1}}"#;
        let plan = Plan::from_llm_output(raw, "cat detector").unwrap();
        assert_eq!(plan.search_keywords, vec!["cats"]);
    }

    #[test]
    fn plan_tolerates_code_fences() {
        let raw = "```json\n{\"search_keywords\":[\"birds\"],\"name\":\"Bird spotter\"}\n```";
        let plan = Plan::from_llm_output(raw, "bird classifier").unwrap();
        assert_eq!(plan.name, "Bird spotter");
    }

    #[test]
    fn utterance_size_phrase_overrides_llm_value() {
        let raw = r#"{"search_keywords":["flower"],"max_dataset_size_gb":10.0}"#;
        let plan =
            Plan::from_llm_output(raw, "flower classifier with dataset under 500MB").unwrap();
        assert_eq!(plan.max_dataset_size_gb, 0.5);
    }

    #[test]
    fn plans_stay_valid_across_diverse_utterances() {
        let utterances = [
            "Train a flower classifier with dataset not more than 1GB",
            "I want a dog breed detector, max 2 GB of data",
            "classify pottery styles",
            "Build me a mushroom identifier using at most 750 megabytes",
            "BIRDS! just birds, under 0.5 gb",
        ];
        let raw = r#"{"search_keywords":["things"]}"#;
        for utterance in utterances {
            let plan = Plan::from_llm_output(raw, utterance).unwrap();
            assert!((3..=80).contains(&plan.name.len()), "bad name for: {utterance}");
            assert!(plan.max_dataset_size_gb > 0.0);
            // Re-parsing the same inputs yields the identical plan.
            assert_eq!(Plan::from_llm_output(raw, utterance).unwrap(), plan);
        }
    }

    #[test]
    fn plan_rejects_missing_keywords() {
        let raw = r#"{"name":"A classifier"}"#;
        let err = Plan::from_llm_output(raw, "something").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::PlanInvalid);
    }

    #[test]
    fn plan_rejects_out_of_range_target() {
        let raw = r#"{"search_keywords":["x"],"target_value":1.5}"#;
        assert!(Plan::from_llm_output(raw, "something").is_err());
    }

    #[test]
    fn plan_rejects_prose_only_output() {
        let err = Plan::from_llm_output("Sure! Here is my plan: train a model.", "x").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::PlanInvalid);
    }

    #[test]
    fn derive_title_cuts_at_word_boundary() {
        let long = "Train an extremely detailed fine grained bird species classification model today";
        let title = derive_title(long);
        assert!(title.len() <= 60);
        assert!(!title.ends_with(' '));
    }
}
