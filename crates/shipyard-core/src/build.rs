//! Build variants and the recipes that build them.
//!
//! A project's type and framework select exactly one [`BuildVariant`]. Each
//! variant has one [`BuildRecipe`] registered in a [`RecipeTable`]; the build
//! stage looks the recipe up instead of branching on framework strings.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::executor::BuildPlan;
use crate::{Error, Result};

const CONTRACT_IMAGE: &str = "paritytech/contracts-ci-linux:production";
const NODE_IMAGE: &str = "node:20-alpine";

/// The closed set of things a pipeline knows how to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
pub enum BuildVariant {
    /// An ink! smart contract.
    #[display("contract")]
    Contract,
    #[display("vite-app")]
    ViteApp,
    #[display("next-app")]
    NextApp,
    /// Svelte and SvelteKit share a recipe.
    #[display("svelte-app")]
    SvelteApp,
}

impl BuildVariant {
    /// Resolve a variant from a project's `type` and optional `framework`.
    pub fn from_project(project_type: &str, framework: Option<&str>) -> Result<Self> {
        match (project_type, framework) {
            ("ink-contract" | "contract", _) => Ok(BuildVariant::Contract),
            ("dapp", Some("vite")) => Ok(BuildVariant::ViteApp),
            ("dapp", Some("nextjs" | "next")) => Ok(BuildVariant::NextApp),
            ("dapp", Some("svelte" | "sveltekit")) => Ok(BuildVariant::SvelteApp),
            ("dapp", Some(other)) => Err(Error::InvalidInput(format!(
                "unsupported framework: {}",
                other
            ))),
            ("dapp", None) => Err(Error::InvalidInput(
                "dapp projects require a framework".to_string(),
            )),
            (other, _) => Err(Error::InvalidInput(format!(
                "unsupported project type: {}",
                other
            ))),
        }
    }
}

/// How to build one variant.
pub trait BuildRecipe: Send + Sync {
    fn variant(&self) -> BuildVariant;

    /// Files that must exist at the repository root for this variant.
    fn required_files(&self) -> &'static [&'static str];

    /// The container plan the executor runs for this variant.
    fn plan(&self) -> BuildPlan;
}

pub struct ContractRecipe;

impl BuildRecipe for ContractRecipe {
    fn variant(&self) -> BuildVariant {
        BuildVariant::Contract
    }

    fn required_files(&self) -> &'static [&'static str] {
        &["Cargo.toml"]
    }

    fn plan(&self) -> BuildPlan {
        BuildPlan {
            image: CONTRACT_IMAGE.to_string(),
            workdir: "/workspace".to_string(),
            commands: vec![command(&["cargo", "contract", "build", "--release"])],
            output_dir: "target/ink".to_string(),
        }
    }
}

/// Node-based web apps differ only in where the bundler writes its output.
pub struct WebAppRecipe {
    variant: BuildVariant,
    output_dir: &'static str,
}

impl WebAppRecipe {
    pub fn vite() -> Self {
        Self {
            variant: BuildVariant::ViteApp,
            output_dir: "dist",
        }
    }

    pub fn next() -> Self {
        Self {
            variant: BuildVariant::NextApp,
            output_dir: ".next",
        }
    }

    pub fn svelte() -> Self {
        Self {
            variant: BuildVariant::SvelteApp,
            output_dir: "build",
        }
    }
}

impl BuildRecipe for WebAppRecipe {
    fn variant(&self) -> BuildVariant {
        self.variant
    }

    fn required_files(&self) -> &'static [&'static str] {
        &["package.json"]
    }

    fn plan(&self) -> BuildPlan {
        BuildPlan {
            image: NODE_IMAGE.to_string(),
            workdir: "/app".to_string(),
            commands: vec![
                command(&["npm", "install", "--frozen-lockfile"]),
                command(&["npm", "run", "build"]),
            ],
            output_dir: self.output_dir.to_string(),
        }
    }
}

fn command(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

/// Maps every variant to its recipe.
#[derive(Clone)]
pub struct RecipeTable {
    recipes: HashMap<BuildVariant, Arc<dyn BuildRecipe>>,
}

impl RecipeTable {
    /// Table with one recipe for every known variant.
    pub fn standard() -> Self {
        let mut table = Self {
            recipes: HashMap::new(),
        };
        table.register(Arc::new(ContractRecipe));
        table.register(Arc::new(WebAppRecipe::vite()));
        table.register(Arc::new(WebAppRecipe::next()));
        table.register(Arc::new(WebAppRecipe::svelte()));
        table
    }

    /// Register a recipe, replacing any existing one for the same variant.
    pub fn register(&mut self, recipe: Arc<dyn BuildRecipe>) {
        self.recipes.insert(recipe.variant(), recipe);
    }

    pub fn get(&self, variant: BuildVariant) -> Result<Arc<dyn BuildRecipe>> {
        self.recipes
            .get(&variant)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no recipe for {}", variant)))
    }
}

impl Default for RecipeTable {
    fn default() -> Self {
        Self::standard()
    }
}
