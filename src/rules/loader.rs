//! Ruleset loaders
//!
//! A loader fills a freshly created detection context with keywords,
//! support tables and signatures. The same loader runs at startup and on
//! every live rule swap.

use crate::config::GeneralConfig;
use crate::detect::context::AddOutcome;
use crate::detect::{DetectError, DetectionContext, ThreadKeyword};
use crate::rules::{Rule, RuleError};
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of loading signatures into a context
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub loaded: usize,
    pub failed: usize,
    /// Signatures dropped or replaced because their sid was already present
    pub duplicates: usize,
    pub failed_files: usize,
}

impl LoadSummary {
    /// No rule or file failed to load
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.failed_files == 0
    }
}

/// Source of a ruleset and its support tables
pub trait RulesetLoader: Send + Sync {
    /// Register thread-local keyword contexts. Runs before any signature is added.
    fn register_keywords(&self, _ctx: &mut DetectionContext) -> Result<(), DetectError> {
        Ok(())
    }

    fn load_classifications(&self, settings: &GeneralConfig, ctx: &mut DetectionContext) -> Result<usize, RuleError>;

    fn load_references(&self, settings: &GeneralConfig, ctx: &mut DetectionContext) -> Result<usize, RuleError>;

    fn load_signatures(&self, settings: &GeneralConfig, ctx: &mut DetectionContext) -> Result<LoadSummary, RuleError>;

    fn load_thresholds(&self, settings: &GeneralConfig, ctx: &mut DetectionContext) -> Result<usize, RuleError>;
}

/// Parse rule lines into the context, counting failures instead of stopping
pub fn load_rules_str(ctx: &mut DetectionContext, source: &str, summary: &mut LoadSummary) -> Result<(), DetectError> {
    for (lineno, line) in source.lines().enumerate() {
        let line: &str = line.trim();

        // Skip comments and empty lines
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        match Rule::new(line) {
            Ok(rule) => match ctx.add_rule(rule)? {
                AddOutcome::Added => summary.loaded += 1,
                AddOutcome::Replaced => {
                    summary.loaded += 1;
                    summary.duplicates += 1;
                }
                AddOutcome::Duplicate => summary.duplicates += 1,
            },
            Err(e) => {
                warn!("Error parsing rule at line {}: {}", lineno + 1, e);
                summary.failed += 1;
            }
        }
    }

    Ok(())
}

/// Loads rules and support tables from the files named in `[general]`
#[derive(Debug, Default, Clone, Copy)]
pub struct RuleFileLoader;

impl RuleFileLoader {
    pub fn new() -> Self {
        Self
    }

    fn read_optional(settings: &GeneralConfig, file: Option<&String>) -> Result<Option<String>, RuleError> {
        let Some(file) = file else {
            return Ok(None);
        };
        let path: PathBuf = settings.rule_path(file);
        debug!("Reading {}", path.display());
        Ok(Some(std::fs::read_to_string(path)?))
    }
}

impl RulesetLoader for RuleFileLoader {
    fn load_classifications(&self, settings: &GeneralConfig, ctx: &mut DetectionContext) -> Result<usize, RuleError> {
        match Self::read_optional(settings, settings.classification_file.as_ref())? {
            Some(source) => ctx.classifications_mut().load_str(&source),
            None => Ok(0),
        }
    }

    fn load_references(&self, settings: &GeneralConfig, ctx: &mut DetectionContext) -> Result<usize, RuleError> {
        match Self::read_optional(settings, settings.reference_file.as_ref())? {
            Some(source) => ctx.references_mut().load_str(&source),
            None => Ok(0),
        }
    }

    fn load_signatures(&self, settings: &GeneralConfig, ctx: &mut DetectionContext) -> Result<LoadSummary, RuleError> {
        let mut summary: LoadSummary = LoadSummary::default();

        for file in &settings.rule_files {
            let path: PathBuf = settings.rule_path(file);
            match std::fs::read_to_string(&path) {
                Ok(source) => {
                    let before: usize = summary.loaded;
                    load_rules_str(ctx, &source, &mut summary)?;
                    info!("Loaded {} rules from {}", summary.loaded - before, path.display());
                }
                Err(e) => {
                    warn!("Failed to read rule file {}: {}", path.display(), e);
                    summary.failed_files += 1;
                }
            }
        }

        Ok(summary)
    }

    fn load_thresholds(&self, settings: &GeneralConfig, ctx: &mut DetectionContext) -> Result<usize, RuleError> {
        match Self::read_optional(settings, settings.threshold_file.as_ref())? {
            Some(source) => ctx.thresholds_mut().load_str(&source),
            None => Ok(0),
        }
    }
}

#[derive(Default)]
struct StaticSources {
    rules: String,
    classifications: String,
    references: String,
    thresholds: String,
}

/// In-memory ruleset, replaceable between swaps
#[derive(Default)]
pub struct StaticRuleset {
    sources: RwLock<StaticSources>,
    keywords: RwLock<Vec<(String, Arc<dyn ThreadKeyword>)>>,
}

impl StaticRuleset {
    pub fn new(rules: impl Into<String>) -> Self {
        let ruleset: StaticRuleset = Self::default();
        ruleset.sources.write().rules = rules.into();
        ruleset
    }

    pub fn with_classifications(self, source: impl Into<String>) -> Self {
        self.sources.write().classifications = source.into();
        self
    }

    pub fn with_references(self, source: impl Into<String>) -> Self {
        self.sources.write().references = source.into();
        self
    }

    pub fn with_thresholds(self, source: impl Into<String>) -> Self {
        self.sources.write().thresholds = source.into();
        self
    }

    /// Register `keyword` on every context built from this ruleset
    pub fn with_keyword(self, name: &str, keyword: Arc<dyn ThreadKeyword>) -> Self {
        self.keywords.write().push((name.to_string(), keyword));
        self
    }

    /// Replace the rules used by the next load
    pub fn set_rules(&self, rules: impl Into<String>) {
        self.sources.write().rules = rules.into();
    }
}

impl RulesetLoader for StaticRuleset {
    fn register_keywords(&self, ctx: &mut DetectionContext) -> Result<(), DetectError> {
        for (name, keyword) in self.keywords.read().iter() {
            ctx.register_keyword(name, Arc::clone(keyword))?;
        }
        Ok(())
    }

    fn load_classifications(&self, _settings: &GeneralConfig, ctx: &mut DetectionContext) -> Result<usize, RuleError> {
        ctx.classifications_mut().load_str(&self.sources.read().classifications)
    }

    fn load_references(&self, _settings: &GeneralConfig, ctx: &mut DetectionContext) -> Result<usize, RuleError> {
        ctx.references_mut().load_str(&self.sources.read().references)
    }

    fn load_signatures(&self, _settings: &GeneralConfig, ctx: &mut DetectionContext) -> Result<LoadSummary, RuleError> {
        let mut summary: LoadSummary = LoadSummary::default();
        load_rules_str(ctx, &self.sources.read().rules, &mut summary)?;
        Ok(summary)
    }

    fn load_thresholds(&self, _settings: &GeneralConfig, ctx: &mut DetectionContext) -> Result<usize, RuleError> {
        ctx.thresholds_mut().load_str(&self.sources.read().thresholds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectConfig;

    #[test]
    fn test_file_loader_counts_failures() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("good.rules"),
            "# local rules\n\
             alert tcp any any -> any 80 (msg:\"one\"; content:\"GET\"; sid:1; rev:1;)\n\
             alert tcp any any -> any 80 (msg:\"broken\"; sid:abc;)\n\
             alert tcp any any -> any 80 (msg:\"one again\"; content:\"POST\"; sid:1; rev:2;)\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("classification.config"), "config classification: misc,Misc,3\n").unwrap();

        let settings: GeneralConfig = GeneralConfig {
            rules_path: dir.path().display().to_string(),
            rule_files: vec!["good.rules".to_string(), "missing.rules".to_string()],
            classification_file: Some("classification.config".to_string()),
            ..GeneralConfig::default()
        };

        let mut ctx: DetectionContext = DetectionContext::new(DetectConfig::default()).unwrap();
        let loader: RuleFileLoader = RuleFileLoader::new();
        assert_eq!(loader.load_classifications(&settings, &mut ctx).unwrap(), 1);
        assert_eq!(loader.load_references(&settings, &mut ctx).unwrap(), 0);

        let summary: LoadSummary = loader.load_signatures(&settings, &mut ctx).unwrap();
        assert_eq!(summary.loaded, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.duplicates, 1);
        assert_eq!(summary.failed_files, 1);
        assert!(!summary.is_clean());
        assert_eq!(ctx.signature_count(), 1);
    }

    #[test]
    fn test_static_ruleset_replaces_rules() {
        let ruleset: StaticRuleset =
            StaticRuleset::new("alert udp any any -> any 53 (msg:\"dns\"; content:\"evil\"; sid:5;)\n");
        let settings: GeneralConfig = GeneralConfig::default();

        let mut first: DetectionContext = DetectionContext::new(DetectConfig::default()).unwrap();
        assert_eq!(ruleset.load_signatures(&settings, &mut first).unwrap().loaded, 1);

        ruleset.set_rules("");
        let mut second: DetectionContext = DetectionContext::new(DetectConfig::default()).unwrap();
        let summary: LoadSummary = ruleset.load_signatures(&settings, &mut second).unwrap();
        assert_eq!(summary, LoadSummary::default());
        assert!(summary.is_clean());
    }
}
