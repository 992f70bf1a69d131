//! Per-fact delivery steps shared by catchup and follow.
//!
//! ```text
//!   candidate ──► blacklist ──► SpecMatcher ──► Transformer ──► deliver
//!                  (drop)        (drop)          (spec version)
//! ```
//!
//! Both phases run every candidate row through the same [`DeliveryPipeline`],
//! so a fact is filtered and shaped identically no matter which phase
//! delivers it.

use std::sync::Arc;

use tracing::warn;

use crate::blacklist::Blacklist;
use crate::error::{Error, Result};
use crate::matcher::SpecMatcher;
use crate::transform::Transformer;
use crate::types::Fact;

pub(crate) struct DeliveryPipeline {
    matcher: SpecMatcher,
    blacklist: Arc<Blacklist>,
    transformer: Arc<Transformer>,
    skip_missing_transformation: bool,
    label: String,
}

impl DeliveryPipeline {
    pub(crate) fn new(
        matcher: SpecMatcher,
        blacklist: Arc<Blacklist>,
        transformer: Arc<Transformer>,
        skip_missing_transformation: bool,
        label: impl Into<String>,
    ) -> Self {
        Self {
            matcher,
            blacklist,
            transformer,
            skip_missing_transformation,
            label: label.into(),
        }
    }

    /// Returns the fact shaped for delivery, or `None` if it must not be
    /// delivered.
    ///
    /// # Errors
    ///
    /// Script failures, and missing transformations unless configured to
    /// skip them.
    pub(crate) fn process(&self, fact: Fact) -> Result<Option<Fact>> {
        if self.blacklist.is_blocked(&fact.id()) {
            return Ok(None);
        }

        let version = match self.matcher.first_match(&fact)? {
            Some(spec) => spec.requested_version(),
            None => return Ok(None),
        };

        match self.transformer.transform(fact, version) {
            Ok(fact) => Ok(Some(fact)),
            Err(Error::MissingTransformationInformation {
                ns,
                fact_type,
                from,
                to,
            }) if self.skip_missing_transformation => {
                warn!(
                    subscription = %self.label,
                    %ns,
                    %fact_type,
                    from,
                    to,
                    "skipping fact without transformation path"
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
