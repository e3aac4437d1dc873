//! Expands content references into the purge targets that serve them.
//!
//! A post is visible in many places besides its permalink: the front page,
//! its date, author and term archives, and their feeds. Paginated archives
//! are only walked up to `max_archive_pages`.

use std::{collections::HashSet, sync::Arc};

use thiserror::Error;
use time::OffsetDateTime;
use url::Url;

use crate::{
    application::repos::{ArchiveScope, ContentRepo, RepoError},
    domain::{
        entities::{DateArchive, PostRecord, TermRecord},
        references::{ContentReference, PurgeTarget},
    },
};

pub const DEFAULT_PERMALINK_TEMPLATE: &str = "/{year}/{month}/{day}/{slug}/";
pub const DEFAULT_POSTS_PER_PAGE: u32 = 10;
pub const DEFAULT_MAX_ARCHIVE_PAGES: u32 = 5;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("post {0} does not exist")]
    PostNotFound(i64),
    #[error("term {0} does not exist")]
    TermNotFound(i64),
    #[error("`{value}` is not a valid purge URL: {reason}")]
    InvalidUrl { value: String, reason: String },
    #[error(transparent)]
    Repo(#[from] RepoError),
}

/// Naming scheme for provider cache tags:
/// `{prefix}-{pattern}[-{year}][-{multisite_id}]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheTagScheme {
    pub prefix: Option<String>,
    pub multisite_id: Option<String>,
}

impl CacheTagScheme {
    pub fn tag(&self, pattern: &str, year: Option<i32>) -> Option<String> {
        let prefix = self.prefix.as_deref()?;
        let mut tag = format!("{prefix}-{pattern}");
        if let Some(year) = year {
            tag.push_str(&format!("-{year}"));
        }
        if let Some(site) = self.multisite_id.as_deref() {
            tag.push('-');
            tag.push_str(site);
        }
        Some(tag)
    }

    /// Bring a caller-supplied tag into the scheme unless it already is.
    pub fn decorate(&self, tag: &str) -> String {
        match self.prefix.as_deref() {
            Some(prefix) if !tag.starts_with(&format!("{prefix}-")) => {
                self.tag(tag, None).unwrap_or_else(|| tag.to_string())
            }
            _ => tag.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Site root; always ends with `/`.
    pub site_url: Url,
    /// Placeholders: `{year}`, `{month}`, `{day}`, `{slug}`, `{id}`, `{post_type}`.
    pub permalink_template: String,
    pub posts_per_page: u32,
    pub max_archive_pages: u32,
    /// Post types listed on the front page.
    pub front_page_post_types: Vec<String>,
    pub feeds: bool,
    /// Site paths that embed term listings and go stale with any term.
    pub term_extra_paths: Vec<String>,
    pub cache_tags: CacheTagScheme,
}

impl ResolverConfig {
    pub fn new(mut site_url: Url) -> Self {
        if !site_url.path().ends_with('/') {
            let path = format!("{}/", site_url.path());
            site_url.set_path(&path);
        }
        Self {
            site_url,
            permalink_template: DEFAULT_PERMALINK_TEMPLATE.to_string(),
            posts_per_page: DEFAULT_POSTS_PER_PAGE,
            max_archive_pages: DEFAULT_MAX_ARCHIVE_PAGES,
            front_page_post_types: vec!["post".to_string()],
            feeds: true,
            term_extra_paths: Vec::new(),
            cache_tags: CacheTagScheme::default(),
        }
    }
}

impl From<&crate::config::SiteSettings> for ResolverConfig {
    fn from(settings: &crate::config::SiteSettings) -> Self {
        Self {
            permalink_template: settings.permalink_template.clone(),
            posts_per_page: settings.posts_per_page.get(),
            max_archive_pages: settings.max_archive_pages,
            front_page_post_types: settings.front_page_post_types.clone(),
            feeds: settings.feeds,
            term_extra_paths: settings.term_extra_paths.clone(),
            cache_tags: CacheTagScheme {
                prefix: settings.cache_tag_prefix.clone(),
                multisite_id: settings.multisite_id.clone(),
            },
            ..Self::new(settings.url.clone())
        }
    }
}

/// Ordered, duplicate-free collection of targets.
#[derive(Default)]
struct Targets {
    seen: HashSet<PurgeTarget>,
    items: Vec<PurgeTarget>,
}

impl Targets {
    fn push(&mut self, target: PurgeTarget) {
        if self.seen.insert(target.clone()) {
            self.items.push(target);
        }
    }

    fn url(&mut self, url: Url) {
        self.push(PurgeTarget::Url(url.into()));
    }

    fn tag(&mut self, tag: Option<String>) {
        if let Some(tag) = tag {
            self.push(PurgeTarget::CacheTag(tag));
        }
    }
}

pub struct Resolver {
    config: ResolverConfig,
    content: Arc<dyn ContentRepo>,
}

impl Resolver {
    pub fn new(config: ResolverConfig, content: Arc<dyn ContentRepo>) -> Self {
        Self { config, content }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Every target that must be purged for `reference`. Reads content
    /// storage but never touches a queue.
    pub async fn resolve(
        &self,
        reference: &ContentReference,
    ) -> Result<Vec<PurgeTarget>, ResolveError> {
        let mut targets = Targets::default();
        match reference {
            ContentReference::Post(id) => {
                let post = self
                    .content
                    .find_post(*id)
                    .await?
                    .ok_or(ResolveError::PostNotFound(*id))?;
                self.resolve_post(&post, &mut targets).await?;
            }
            ContentReference::Term(id) => {
                let term = self
                    .content
                    .find_term(*id)
                    .await?
                    .ok_or(ResolveError::TermNotFound(*id))?;
                self.resolve_term(&term, &mut targets).await?;
            }
            ContentReference::Url(value) => targets.url(self.parse_url(value)?),
            ContentReference::CacheTag(tag) => {
                targets.push(PurgeTarget::CacheTag(self.config.cache_tags.decorate(tag)));
            }
            ContentReference::All => targets.push(PurgeTarget::All),
        }
        Ok(targets.items)
    }

    async fn resolve_post(
        &self,
        post: &PostRecord,
        targets: &mut Targets,
    ) -> Result<(), ResolveError> {
        let permalink = self.permalink(post)?;
        targets.url(permalink.clone());
        if self.config.feeds && permalink.query().is_none() {
            targets.url(self.child(&permalink, "feed/")?);
        }

        if self.config.front_page_post_types.contains(&post.post_type) {
            let scope = ArchiveScope::Home {
                post_types: self.config.front_page_post_types.clone(),
            };
            let root = self.config.site_url.clone();
            self.archive(&root, &scope, targets).await?;
        }

        if post.post_type != "post" && post.post_type != "page" {
            let base = self.site_path(&format!("{}/", post.post_type))?;
            self.archive(&base, &ArchiveScope::PostType(post.post_type.clone()), targets)
                .await?;
        }

        if let Some(published_at) = post.published_at {
            for (path, archive) in date_archives(published_at) {
                let base = self.site_path(&path)?;
                self.archive(&base, &ArchiveScope::Date(archive), targets)
                    .await?;
            }
        }

        if let Some(author) = post.author_slug.as_deref() {
            let base = self.site_path(&format!("author/{author}/"))?;
            self.archive(&base, &ArchiveScope::Author(author.to_string()), targets)
                .await?;
        }

        for term in &post.terms {
            self.term_archive(term, targets).await?;
        }

        let cache_tags = &self.config.cache_tags;
        targets.tag(cache_tags.tag(&format!("post-{}", post.id), None));
        if let Some(published_at) = post.published_at {
            targets.tag(cache_tags.tag("archive", Some(published_at.year())));
        }
        Ok(())
    }

    async fn resolve_term(
        &self,
        term: &TermRecord,
        targets: &mut Targets,
    ) -> Result<(), ResolveError> {
        self.term_archive(term, targets).await?;
        for path in &self.config.term_extra_paths {
            targets.url(self.site_path(path.trim_start_matches('/'))?);
        }
        targets.tag(self.config.cache_tags.tag(&format!("term-{}", term.id), None));
        Ok(())
    }

    async fn term_archive(
        &self,
        term: &TermRecord,
        targets: &mut Targets,
    ) -> Result<(), ResolveError> {
        let base = self.site_path(&format!("{}/{}/", term_base(&term.taxonomy), term.slug))?;
        self.archive(&base, &ArchiveScope::Term(term.id), targets)
            .await
    }

    /// An archive listing: its first page, bounded pagination, and feed.
    async fn archive(
        &self,
        base: &Url,
        scope: &ArchiveScope,
        targets: &mut Targets,
    ) -> Result<(), ResolveError> {
        targets.url(base.clone());

        let count = self.content.count_published(scope).await?;
        for page in 2..=self.page_count(count) {
            targets.url(self.child(base, &format!("page/{page}/"))?);
        }

        if self.config.feeds {
            targets.url(self.child(base, "feed/")?);
        }
        Ok(())
    }

    fn page_count(&self, published: u64) -> u32 {
        let per_page = u64::from(self.config.posts_per_page.max(1));
        let pages = published.div_ceil(per_page);
        u32::try_from(pages)
            .unwrap_or(u32::MAX)
            .min(self.config.max_archive_pages)
    }

    fn permalink(&self, post: &PostRecord) -> Result<Url, ResolveError> {
        let template = &self.config.permalink_template;
        let dated = ["{year}", "{month}", "{day}"]
            .iter()
            .any(|placeholder| template.contains(placeholder));

        let path = match post.published_at {
            Some(at) => render_permalink(template, post, at),
            // Unpublished posts have no dated permalink yet.
            None if dated => return self.site_path(&format!("?p={}", post.id)),
            None => render_permalink(template, post, OffsetDateTime::UNIX_EPOCH),
        };
        self.site_path(path.trim_start_matches('/'))
    }

    fn site_path(&self, path: &str) -> Result<Url, ResolveError> {
        self.child(&self.config.site_url, path)
    }

    fn child(&self, base: &Url, path: &str) -> Result<Url, ResolveError> {
        let base = if base.path().ends_with('/') {
            base.clone()
        } else {
            let mut base = base.clone();
            let path = format!("{}/", base.path());
            base.set_path(&path);
            base
        };
        base.join(path).map_err(|err| ResolveError::InvalidUrl {
            value: path.to_string(),
            reason: err.to_string(),
        })
    }

    fn parse_url(&self, value: &str) -> Result<Url, ResolveError> {
        let invalid = |reason: String| ResolveError::InvalidUrl {
            value: value.to_string(),
            reason,
        };
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(invalid("empty".to_string()));
        }

        let url = match Url::parse(trimmed) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) => self
                .config
                .site_url
                .join(trimmed)
                .map_err(|err| invalid(err.to_string()))?,
            Err(err) => return Err(invalid(err.to_string())),
        };

        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(invalid(format!("unsupported scheme `{other}`"))),
        }
    }
}

fn render_permalink(template: &str, post: &PostRecord, at: OffsetDateTime) -> String {
    template
        .replace("{year}", &format!("{:04}", at.year()))
        .replace("{month}", &format!("{:02}", u8::from(at.month())))
        .replace("{day}", &format!("{:02}", at.day()))
        .replace("{slug}", &post.slug)
        .replace("{id}", &post.id.to_string())
        .replace("{post_type}", &post.post_type)
}

fn date_archives(at: OffsetDateTime) -> [(String, DateArchive); 3] {
    let (year, month, day) = (at.year(), at.month(), at.day());
    [
        (format!("{year:04}/"), DateArchive::year(year)),
        (
            format!("{year:04}/{:02}/", u8::from(month)),
            DateArchive::month(year, month),
        ),
        (
            format!("{year:04}/{:02}/{day:02}/", u8::from(month)),
            DateArchive::day(at.date()),
        ),
    ]
}

fn term_base(taxonomy: &str) -> &str {
    match taxonomy {
        "category" => "category",
        "post_tag" => "tag",
        other => other,
    }
}
