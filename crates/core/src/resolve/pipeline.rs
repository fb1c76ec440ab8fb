use std::collections::BTreeMap;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::api::{
    endpoints, unique_ids, ApiError, Build, BuildTab, CharacterEquipment, Dispatcher,
    EquipmentSlot, Identified, Item, RequestOptions, Result, Skill, SkillBar, Specialization,
    SpecializationLine, Trait,
};

/// A character's active build with every referenced id looked up.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedBuild {
    pub character_name: String,
    pub profession: Option<String>,
    pub specializations: Vec<SpecializationLine>,
    pub land_skills: Option<SkillBar>,
    pub aquatic_skills: Option<SkillBar>,
    pub traits_by_id: BTreeMap<u32, Trait>,
    pub skills_by_id: BTreeMap<u32, Skill>,
    pub specializations_by_id: BTreeMap<u32, Specialization>,
}

/// A character's equipment with every referenced item looked up.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedEquipment {
    pub character_name: String,
    pub equipment: Vec<EquipmentSlot>,
    pub items: Vec<Item>,
    pub items_by_id: BTreeMap<u32, Item>,
}

/// Ids referenced by a build, each list deduplicated in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildIds {
    pub traits: Vec<u32>,
    pub skills: Vec<u32>,
    pub specializations: Vec<u32>,
}

impl BuildIds {
    /// Collect trait, skill and specialization ids from a build.
    pub fn collect(build: &Build) -> Self {
        let traits = unique_ids(
            build
                .specializations
                .iter()
                .flat_map(|line| line.traits.iter().copied()),
        );
        let skills = unique_ids(
            [&build.skills, &build.aquatic_skills]
                .into_iter()
                .flatten()
                .flat_map(SkillBar::skill_ids),
        );
        let specializations = unique_ids(build.specializations.iter().filter_map(|line| line.id));
        Self {
            traits,
            skills,
            specializations,
        }
    }
}

/// Turns per-character references into indexed lookup tables.
#[derive(Debug, Clone)]
pub struct ResolutionPipeline {
    dispatcher: Dispatcher,
}

impl ResolutionPipeline {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    /// Active build tab, unresolved.
    pub async fn active_build(&self, character_name: &str, secret: Option<&str>) -> Result<BuildTab> {
        let name = require_name(character_name)?;
        self.dispatcher
            .dispatch_as(
                &endpoints::active_build(name),
                RequestOptions::authenticated(secret),
            )
            .await
    }

    /// Equipment list, unresolved.
    pub async fn equipment(
        &self,
        character_name: &str,
        secret: Option<&str>,
    ) -> Result<CharacterEquipment> {
        let name = require_name(character_name)?;
        self.dispatcher
            .dispatch_as(&endpoints::equipment(name), RequestOptions::authenticated(secret))
            .await
    }

    /// Fetch the active build, then look up its traits, skills and
    /// specializations concurrently.
    ///
    /// Fails as a whole if any request fails, or with
    /// [`ApiError::Cancelled`] if `cancel` fired before completion.
    pub async fn resolve_build(
        &self,
        character_name: &str,
        secret: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ResolvedBuild> {
        let name = require_name(character_name)?;
        ensure_live(cancel)?;

        let tab = self.active_build(name, secret).await?;
        let build = tab.build;
        let ids = BuildIds::collect(&build);
        debug!(
            character = name,
            traits = ids.traits.len(),
            skills = ids.skills.len(),
            specializations = ids.specializations.len(),
            "resolving build"
        );

        let (traits, skills, specializations) = tokio::try_join!(
            self.dispatcher.bulk_get::<Trait>(endpoints::TRAITS, &ids.traits),
            self.dispatcher.bulk_get::<Skill>(endpoints::SKILLS, &ids.skills),
            self.dispatcher
                .bulk_get::<Specialization>(endpoints::SPECIALIZATIONS, &ids.specializations),
        )?;
        ensure_live(cancel)?;

        let resolved = ResolvedBuild {
            character_name: name.to_string(),
            profession: build.profession,
            specializations: build.specializations,
            land_skills: build.skills,
            aquatic_skills: build.aquatic_skills,
            traits_by_id: index_by_id(traits),
            skills_by_id: index_by_id(skills),
            specializations_by_id: index_by_id(specializations),
        };
        info!(
            character = name,
            traits = resolved.traits_by_id.len(),
            skills = resolved.skills_by_id.len(),
            specializations = resolved.specializations_by_id.len(),
            "build resolved"
        );
        Ok(resolved)
    }

    /// Fetch equipment, then look up every referenced item in one call.
    pub async fn resolve_equipment(
        &self,
        character_name: &str,
        secret: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ResolvedEquipment> {
        let name = require_name(character_name)?;
        ensure_live(cancel)?;

        let equipment = self.equipment(name, secret).await?.equipment;
        let item_ids = unique_ids(equipment.iter().filter_map(|slot| slot.id));
        debug!(character = name, items = item_ids.len(), "resolving equipment");

        let items: Vec<Item> = self.dispatcher.bulk_get(endpoints::ITEMS, &item_ids).await?;
        ensure_live(cancel)?;

        let items_by_id = index_by_id(items.iter().cloned());
        info!(
            character = name,
            slots = equipment.len(),
            items = items_by_id.len(),
            "equipment resolved"
        );
        Ok(ResolvedEquipment {
            character_name: name.to_string(),
            equipment,
            items,
            items_by_id,
        })
    }
}

fn require_name(character_name: &str) -> Result<&str> {
    let name = character_name.trim();
    if name.is_empty() {
        return Err(ApiError::InvalidInput(
            "Character name is required".to_string(),
        ));
    }
    Ok(name)
}

fn ensure_live(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        debug!("resolution superseded, dropping result");
        return Err(ApiError::Cancelled);
    }
    Ok(())
}

fn index_by_id<T: Identified>(records: impl IntoIterator<Item = T>) -> BTreeMap<u32, T> {
    records
        .into_iter()
        .map(|record| (record.id(), record))
        .collect()
}
