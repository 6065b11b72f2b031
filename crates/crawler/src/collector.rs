use indexmap::IndexSet;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;
use url::Url;

use crate::{parse_selector, CrawlerError, Reference, Snapshot};

/// The one DOM capability the collector relies on.
pub trait AnchorExtractor {
    /// Raw `href` values of every anchor inside the first element matching
    /// `container`, in document order. `None` when no such element exists.
    fn anchor_targets(&self, snapshot: &Snapshot, container: &Selector) -> Option<Vec<String>>;
}

/// [`AnchorExtractor`] backed by the `scraper` HTML parser.
#[derive(Debug, Default, Clone, Copy)]
pub struct HtmlAnchors;

impl AnchorExtractor for HtmlAnchors {
    fn anchor_targets(&self, snapshot: &Snapshot, container: &Selector) -> Option<Vec<String>> {
        let document = Html::parse_document(snapshot.html());
        let root = document.select(container).next()?;

        let targets = root
            .descendants()
            .filter_map(ElementRef::wrap)
            .filter(|element| element.value().name() == "a")
            .filter_map(|element| element.value().attr("href"))
            .map(str::to_string)
            .collect();
        Some(targets)
    }
}

/// Result of one collection pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Collection {
    /// The results container is not in the page (yet).
    ContainerMissing,
    /// Container found; references deduplicated within this pass.
    Found(Vec<Reference>),
}

impl Collection {
    pub fn references(&self) -> &[Reference] {
        match self {
            Collection::ContainerMissing => &[],
            Collection::Found(references) => references,
        }
    }
}

pub struct LinkCollector<E = HtmlAnchors> {
    origin: Url,
    container: Selector,
    prefixes: Vec<String>,
    extractor: E,
}

impl LinkCollector<HtmlAnchors> {
    /// `prefixes` restricts accepted links by path; empty accepts every
    /// link on the origin's host.
    pub fn new(origin: &str, container: &str, prefixes: Vec<String>) -> Result<Self, CrawlerError> {
        Self::with_extractor(origin, container, prefixes, HtmlAnchors)
    }
}

impl<E: AnchorExtractor> LinkCollector<E> {
    pub fn with_extractor(
        origin: &str,
        container: &str,
        prefixes: Vec<String>,
        extractor: E,
    ) -> Result<Self, CrawlerError> {
        let origin = Url::parse(origin).map_err(|e| CrawlerError::InvalidUrl(e.to_string()))?;
        if origin.cannot_be_a_base() {
            return Err(CrawlerError::InvalidUrl(format!(
                "{} cannot be used as an origin",
                origin
            )));
        }

        Ok(Self {
            origin,
            container: parse_selector(container)?,
            prefixes,
            extractor,
        })
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    pub fn collect(&self, snapshot: &Snapshot) -> Collection {
        let Some(targets) = self.container_anchors(snapshot) else {
            return Collection::ContainerMissing;
        };

        let total = targets.len();
        let references: IndexSet<Reference> = targets
            .iter()
            .filter_map(|href| self.resolve(href))
            .collect();

        debug!(
            "Collected {} references from {} anchors",
            references.len(),
            total
        );
        Collection::Found(references.into_iter().collect())
    }

    /// Raw anchor targets of the results container.
    pub fn container_anchors(&self, snapshot: &Snapshot) -> Option<Vec<String>> {
        self.extractor.anchor_targets(snapshot, &self.container)
    }

    fn resolve(&self, href: &str) -> Option<Reference> {
        let reference = Reference::resolve(&self.origin, href)?;
        let url = Url::parse(reference.as_str()).ok()?;
        if url.host_str() != self.origin.host_str() {
            return None;
        }
        if !self.prefixes.is_empty()
            && !self.prefixes.iter().any(|prefix| url.path().starts_with(prefix.as_str()))
        {
            return None;
        }
        Some(reference)
    }
}
