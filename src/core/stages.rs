//! Pipeline stage registry.
//!
//! Static description of the five-stage content pipeline: declared order,
//! dependency edges, per-stage output directories, and the external script
//! each stage delegates to. Pure lookup, no mutable state.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::Error;

/// One named step of the content pipeline.
///
/// The declared order below is the execution order used by full pipeline
/// runs. The two final stages are siblings: `YoutubeScripts` does not
/// depend on `SocialMedia`, it only sequences after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Keyword clustering and SERP analysis
    KeywordResearch,
    /// Content outline generation with competitive analysis
    ContentBriefs,
    /// Article generation and writing
    ArticleWriting,
    /// Multi-platform social media content creation
    SocialMedia,
    /// YouTube video script generation
    YoutubeScripts,
}

impl Stage {
    /// All stages in declared (execution) order.
    pub const ALL: [Stage; 5] = [
        Stage::KeywordResearch,
        Stage::ContentBriefs,
        Stage::ArticleWriting,
        Stage::SocialMedia,
        Stage::YoutubeScripts,
    ];

    /// The stable wire name used in snapshots and progress events.
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::KeywordResearch => "keyword_research",
            Stage::ContentBriefs => "content_briefs",
            Stage::ArticleWriting => "article_writing",
            Stage::SocialMedia => "social_media",
            Stage::YoutubeScripts => "youtube_scripts",
        }
    }

    /// Position in declared order (0-based).
    pub fn index(self) -> usize {
        Stage::ALL.iter().position(|s| *s == self).unwrap_or(0)
    }

    /// Stages that must be `completed` before this one may run.
    pub fn dependencies(self) -> &'static [Stage] {
        match self {
            Stage::KeywordResearch => &[],
            Stage::ContentBriefs => &[Stage::KeywordResearch],
            Stage::ArticleWriting => &[Stage::KeywordResearch, Stage::ContentBriefs],
            Stage::SocialMedia => {
                &[Stage::KeywordResearch, Stage::ContentBriefs, Stage::ArticleWriting]
            }
            // Sibling of social_media, not downstream of it.
            Stage::YoutubeScripts => {
                &[Stage::KeywordResearch, Stage::ContentBriefs, Stage::ArticleWriting]
            }
        }
    }

    /// Numbered output subdirectory inside a project.
    pub fn dir_name(self) -> &'static str {
        match self {
            Stage::KeywordResearch => "stage_01_keyword_research",
            Stage::ContentBriefs => "stage_02_content_briefs",
            Stage::ArticleWriting => "stage_03_articles",
            Stage::SocialMedia => "stage_04_social_media",
            Stage::YoutubeScripts => "stage_05_youtube",
        }
    }

    /// Human description shown in status output.
    pub fn description(self) -> &'static str {
        match self {
            Stage::KeywordResearch => "Keyword clustering and SERP analysis",
            Stage::ContentBriefs => "Content outline generation with competitive analysis",
            Stage::ArticleWriting => "Article generation and writing",
            Stage::SocialMedia => "Multi-platform social media content creation",
            Stage::YoutubeScripts => "YouTube video script generation",
        }
    }

    /// File names the stage is expected to produce, used for post-run
    /// output organization.
    pub fn expected_outputs(self) -> &'static [&'static str] {
        match self {
            Stage::KeywordResearch => &["keyword_clusters.csv", "cluster_summary.csv"],
            Stage::ContentBriefs => &["article_briefs.json", "article_briefs.md"],
            Stage::ArticleWriting => &["article_draft.json", "article_draft.md"],
            Stage::SocialMedia => &["social_posts.json", "social_posts.md"],
            Stage::YoutubeScripts => &["youtube_script.json", "youtube_script.md"],
        }
    }

    /// Script delegated to for this stage, by generator backend.
    ///
    /// Keyword research has a single implementation; the content stages
    /// have claude/openai variants and fall back to the openai script for
    /// an unrecognized backend name.
    pub fn script_name(self, generator: &str) -> &'static str {
        match self {
            Stage::KeywordResearch => "KeywordResearcher.py",
            Stage::ContentBriefs => match generator {
                "claude" => "ArticleBrief_Claude.py",
                _ => "ArticleBrief.py",
            },
            Stage::ArticleWriting => match generator {
                "claude" => "ArticleWriter_Claude.py",
                _ => "ArticleWriter.py",
            },
            Stage::SocialMedia => match generator {
                "claude" => "SocialMedia_Claude.py",
                _ => "SocialMedia.py",
            },
            Stage::YoutubeScripts => match generator {
                "claude" => "YouTubeScript_Claude.py",
                _ => "YouTubeScript.py",
            },
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| Error::UnknownStage(s.to_string()))
    }
}

/// Immutable lookup over the pipeline topology.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageRegistry;

impl StageRegistry {
    /// Create the registry.
    pub fn new() -> Self {
        Self
    }

    /// Stages in declared execution order.
    pub fn ordered(&self) -> &'static [Stage] {
        &Stage::ALL
    }

    /// Resolve a stage by wire name.
    pub fn parse(&self, name: &str) -> Result<Stage, Error> {
        name.parse()
    }

    /// Dependency edges for a stage.
    pub fn dependencies(&self, stage: Stage) -> &'static [Stage] {
        stage.dependencies()
    }

    /// Stages in execution order starting at `start` (inclusive).
    pub fn ordered_from(&self, start: Stage) -> &'static [Stage] {
        &Stage::ALL[start.index()..]
    }
}
