//! Building a detection context generation from configuration and rules
//!
//! Used for the first context at startup and for every live rule swap.

use crate::config::{ConfTree, DetectConfig, NorxConfig};
use crate::detect::DetectionContext;
use crate::rules::{LoadSummary, RulesetLoader};
use crate::swap::SwapError;
use tracing::{info, warn};

/// A fully built detection context and the settings it was built from
pub struct Generation {
    pub ctx: DetectionContext,
    pub settings: NorxConfig,
    pub summary: LoadSummary,
}

/// Create a detection context from `tree` and fill it through `loader`.
///
/// Configuration errors are always fatal. Rule loading problems are fatal only
/// when `engine.init-failure-fatal` is set; otherwise they are logged and the
/// context is built from whatever loaded.
pub fn build_generation(tree: &ConfTree, loader: &dyn RulesetLoader) -> Result<Generation, SwapError> {
    let settings: NorxConfig = NorxConfig::from_tree(tree)?;
    let detect_config: DetectConfig = DetectConfig::resolve(tree)?;
    let failure_fatal: bool = detect_config.failure_fatal;

    let mut ctx: DetectionContext = DetectionContext::new(detect_config)?;
    loader.register_keywords(&mut ctx)?;

    match loader.load_classifications(&settings.general, &mut ctx) {
        Ok(n) if n > 0 => info!("Loaded {} classifications", n),
        Ok(_) => {}
        Err(e) => warn!("Failed to load classifications: {}", e),
    }
    match loader.load_references(&settings.general, &mut ctx) {
        Ok(n) if n > 0 => info!("Loaded {} reference systems", n),
        Ok(_) => {}
        Err(e) => warn!("Failed to load references: {}", e),
    }

    let summary: LoadSummary = match loader.load_signatures(&settings.general, &mut ctx) {
        Ok(summary) => summary,
        Err(e) if failure_fatal => return Err(SwapError::RuleLoad(e.to_string())),
        Err(e) => {
            warn!("Failed to load signatures: {}", e);
            LoadSummary::default()
        }
    };
    if !summary.is_clean() {
        if failure_fatal {
            return Err(SwapError::RuleLoad(format!(
                "{} rules and {} rule files failed to load",
                summary.failed, summary.failed_files
            )));
        }
        warn!(
            failed = summary.failed,
            failed_files = summary.failed_files,
            "Some rules failed to load, continuing with the rest"
        );
    }

    ctx.build_signature_groups()?;

    match loader.load_thresholds(&settings.general, &mut ctx) {
        Ok(n) if n > 0 => info!("Loaded {} threshold entries", n),
        Ok(_) => {}
        Err(e) if failure_fatal => return Err(SwapError::RuleLoad(e.to_string())),
        Err(e) => warn!("Failed to load thresholds: {}", e),
    }

    info!(
        ctx = ctx.id(),
        profile = %ctx.config().profile,
        signatures = ctx.signature_count(),
        groups = ctx.group_count(),
        duplicates = summary.duplicates,
        "Detection context built"
    );

    Ok(Generation { ctx, settings, summary })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::StaticRuleset;

    const RULES: &str = r#"
alert tcp any any -> any 80 (msg:"one"; content:"a"; sid:1;)
alert tcp any any -> any 80 (msg:"broken"; content:"b" sid:2)
alert udp any any -> any 53 (msg:"three"; content:"c"; sid:3;)
"#;

    #[test]
    fn test_bad_rules_are_skipped_by_default() {
        let tree: ConfTree = ConfTree::from_toml_str("").unwrap();
        let generation: Generation = build_generation(&tree, &StaticRuleset::new(RULES)).unwrap();
        assert_eq!(generation.summary.loaded, 2);
        assert_eq!(generation.summary.failed, 1);
        assert!(generation.ctx.is_built());
        assert_eq!(generation.ctx.signature_count(), 2);
    }

    #[test]
    fn test_bad_rules_are_fatal_when_configured() {
        let tree: ConfTree = ConfTree::from_toml_str("[engine]\ninit-failure-fatal = true\n").unwrap();
        let err: SwapError = build_generation(&tree, &StaticRuleset::new(RULES)).err().unwrap();
        assert!(matches!(err, SwapError::RuleLoad(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_invalid_config_is_fatal() {
        let tree: ConfTree = ConfTree::from_toml_str("[detect-engine]\nsgh-mpm-context = \"sometimes\"\n").unwrap();
        let err: SwapError = build_generation(&tree, &StaticRuleset::new(RULES)).err().unwrap();
        assert!(matches!(err, SwapError::Config(_)));
        assert!(err.is_fatal());
    }
}
