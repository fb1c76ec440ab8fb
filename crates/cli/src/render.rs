//! Plain-text views of engine state.

use gw2dash_core::{resolve::EquipmentGroup, ResolvedBuild, ResolvedEquipment, Snapshot};

const NONE: &str = "-";

pub fn accounts(snapshot: &Snapshot) -> String {
    if snapshot.credentials.is_empty() {
        return "No API keys stored.\n".to_string();
    }

    let selected = snapshot.selection.selected_credential_id.as_deref();
    let mut lines = Vec::new();
    for entry in &snapshot.credentials {
        let marker = if selected == Some(entry.id.as_str()) { "*" } else { " " };
        let account = snapshot
            .accounts_by_credential
            .get(&entry.id)
            .map(|account| account.name.as_str())
            .unwrap_or("(not loaded)");
        lines.push(format!("{marker} {}  {account}  {}", entry.fingerprint, entry.id));
        if let Some(characters) = snapshot.characters_by_credential.get(&entry.id) {
            for name in characters {
                let current = marker == "*"
                    && snapshot.selection.selected_character.as_deref() == Some(name.as_str());
                lines.push(format!("    {} {name}", if current { ">" } else { " " }));
            }
        }
    }
    if let Some(error) = snapshot.last_error.as_deref() {
        lines.push(format!("last error: {error}"));
    }
    finish(lines)
}

pub fn selection(snapshot: &Snapshot) -> String {
    let key = snapshot
        .selected_entry()
        .map(|entry| entry.fingerprint.as_str())
        .unwrap_or(NONE);
    let character = snapshot
        .selection
        .selected_character
        .as_deref()
        .unwrap_or(NONE);
    format!("key: {key}\ncharacter: {character}\n")
}

pub fn build(build: &ResolvedBuild) -> String {
    let mut lines = vec![format!(
        "{} ({})",
        build.character_name,
        build.profession.as_deref().unwrap_or("unknown profession")
    )];

    lines.push("Specializations:".to_string());
    if build.specializations.is_empty() {
        lines.push(format!("  {NONE}"));
    }
    for line in &build.specializations {
        let name = line
            .id
            .and_then(|id| build.specializations_by_id.get(&id))
            .and_then(|spec| spec.name.as_deref())
            .unwrap_or(NONE);
        let traits: Vec<&str> = line
            .traits
            .iter()
            .map(|id| {
                build
                    .traits_by_id
                    .get(id)
                    .and_then(|t| t.name.as_deref())
                    .unwrap_or(NONE)
            })
            .collect();
        lines.push(format!("  {name}: {}", traits.join(", ")));
    }

    for (label, bar) in [
        ("Skills", &build.land_skills),
        ("Aquatic skills", &build.aquatic_skills),
    ] {
        let Some(bar) = bar else { continue };
        let skill = |id: Option<u32>| {
            id.and_then(|id| build.skills_by_id.get(&id))
                .and_then(|skill| skill.name.as_deref())
                .unwrap_or(NONE)
        };
        let utilities: Vec<&str> = bar.utilities.iter().map(|id| skill(Some(*id))).collect();
        lines.push(format!("{label}:"));
        lines.push(format!("  heal: {}", skill(bar.heal)));
        lines.push(format!("  utilities: {}", utilities.join(", ")));
        lines.push(format!("  elite: {}", skill(bar.elite)));
    }
    finish(lines)
}

pub fn equipment(equipment: &ResolvedEquipment) -> String {
    let mut lines = vec![equipment.character_name.clone()];
    for (group, slots) in equipment.grouped() {
        lines.push(format!("{group}:"));
        for view in slots {
            let name = match (view.item, view.equipped) {
                (Some(item), _) => item.name.as_deref().unwrap_or(NONE).to_string(),
                (None, Some(slot)) => slot
                    .id
                    .map(|id| format!("item {id}"))
                    .unwrap_or_else(|| NONE.to_string()),
                (None, None) => NONE.to_string(),
            };
            lines.push(format!("  {:<15}{name}", view.slot));
        }
    }
    let ungrouped = equipment
        .equipment
        .iter()
        .filter(|slot| slot.slot.as_deref().and_then(EquipmentGroup::of).is_none())
        .count();
    if ungrouped > 0 {
        lines.push(format!("({ungrouped} other entries)"));
    }
    finish(lines)
}

fn finish(mut lines: Vec<String>) -> String {
    lines.push(String::new());
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use gw2dash_core::SelectionState;
    use std::collections::HashMap;

    #[test]
    fn empty_store_says_so() {
        let snapshot = Snapshot {
            hydrated: true,
            credentials: Vec::new(),
            accounts_by_credential: HashMap::new(),
            characters_by_credential: HashMap::new(),
            selection: SelectionState::default(),
            loading: false,
            last_error: None,
        };
        assert_eq!(accounts(&snapshot), "No API keys stored.\n");
        assert_eq!(selection(&snapshot), "key: -\ncharacter: -\n");
    }
}
