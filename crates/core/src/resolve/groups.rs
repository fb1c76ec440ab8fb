use std::{collections::HashMap, fmt};

use once_cell::sync::Lazy;

use super::pipeline::ResolvedEquipment;
use crate::api::{EquipmentSlot, Item};

/// Display groups for equipment slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EquipmentGroup {
    Armor,
    Weapons,
    Trinkets,
    Tools,
}

impl EquipmentGroup {
    /// All groups in display order.
    pub const ALL: [EquipmentGroup; 4] = [
        EquipmentGroup::Armor,
        EquipmentGroup::Weapons,
        EquipmentGroup::Trinkets,
        EquipmentGroup::Tools,
    ];

    /// Slot names in display order.
    pub fn slots(self) -> &'static [&'static str] {
        match self {
            EquipmentGroup::Armor => &["Helm", "Shoulders", "Coat", "Gloves", "Leggings", "Boots"],
            EquipmentGroup::Weapons => &[
                "WeaponA1",
                "WeaponA2",
                "WeaponB1",
                "WeaponB2",
                "WeaponAquaticA",
                "WeaponAquaticB",
            ],
            EquipmentGroup::Trinkets => &[
                "Backpack",
                "Accessory1",
                "Accessory2",
                "Ring1",
                "Ring2",
                "Amulet",
            ],
            EquipmentGroup::Tools => &["Sickle", "Axe", "Pick"],
        }
    }

    /// Group a slot name belongs to.
    pub fn of(slot: &str) -> Option<EquipmentGroup> {
        static BY_SLOT: Lazy<HashMap<&'static str, EquipmentGroup>> = Lazy::new(|| {
            EquipmentGroup::ALL
                .iter()
                .flat_map(|group| group.slots().iter().map(move |slot| (*slot, *group)))
                .collect()
        });
        BY_SLOT.get(slot).copied()
    }
}

impl fmt::Display for EquipmentGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EquipmentGroup::Armor => "Armor",
            EquipmentGroup::Weapons => "Weapons",
            EquipmentGroup::Trinkets => "Trinkets",
            EquipmentGroup::Tools => "Tools",
        };
        f.write_str(label)
    }
}

/// One fixed slot position and whatever occupies it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlotView<'a> {
    pub slot: &'static str,
    pub equipped: Option<&'a EquipmentSlot>,
    pub item: Option<&'a Item>,
}

impl ResolvedEquipment {
    /// Every known slot per group, in display order. When several entries
    /// report the same slot the last one wins.
    pub fn grouped(&self) -> Vec<(EquipmentGroup, Vec<SlotView<'_>>)> {
        let by_slot: HashMap<&str, &EquipmentSlot> = self
            .equipment
            .iter()
            .filter_map(|entry| entry.slot.as_deref().map(|slot| (slot, entry)))
            .collect();

        EquipmentGroup::ALL
            .iter()
            .map(|group| {
                let views = group
                    .slots()
                    .iter()
                    .map(|slot| {
                        let equipped = by_slot.get(slot).copied();
                        let item = equipped
                            .and_then(|entry| entry.id)
                            .and_then(|id| self.items_by_id.get(&id));
                        SlotView {
                            slot: *slot,
                            equipped,
                            item,
                        }
                    })
                    .collect();
                (*group, views)
            })
            .collect()
    }
}
