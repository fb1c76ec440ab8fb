//! Remote API access: dispatch, error taxonomy, and typed payloads.

/// Single-call HTTP dispatcher.
pub mod dispatcher;
/// Failure classification.
pub mod error;
/// Endpoint payload records.
pub mod models;

pub use dispatcher::{unique_ids, Dispatcher, ErrorSlot, RequestOptions, CACHE_DEFEAT_PARAM};
pub use error::{ApiError, Result};
pub use models::{
    Account, Build, BuildTab, CharacterEquipment, CharacterNameList, EquipmentSlot, Identified,
    Item, Skill, SkillBar, Specialization, SpecializationLine, Trait,
};

/// Endpoint paths relative to the configured base URL.
pub mod endpoints {
    /// Account profile of the key owner.
    pub const ACCOUNT: &str = "/account";
    /// Character names visible to the key.
    pub const CHARACTERS: &str = "/characters";
    /// Public trait records.
    pub const TRAITS: &str = "/traits";
    /// Public skill records.
    pub const SKILLS: &str = "/skills";
    /// Public specialization records.
    pub const SPECIALIZATIONS: &str = "/specializations";
    /// Public item records.
    pub const ITEMS: &str = "/items";

    /// Active build tab of one character.
    pub fn active_build(character: &str) -> String {
        format!("/characters/{character}/buildtabs/active")
    }

    /// Equipped items of one character.
    pub fn equipment(character: &str) -> String {
        format!("/characters/{character}/equipment")
    }
}
