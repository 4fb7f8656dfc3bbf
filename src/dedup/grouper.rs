use std::collections::HashMap;

use crate::items::{IdentityKey, Item};

pub struct IdentityGrouper;

impl IdentityGrouper {
    /// Group items by exact identity key and drop singletons.
    ///
    /// Groups are ordered by their lowest member id and members within a group
    /// are in id order, independent of the input order.
    pub fn group(mut items: Vec<Item>) -> Vec<(IdentityKey, Vec<Item>)> {
        items.sort_by_key(Item::item_id);

        let mut index: HashMap<IdentityKey, usize> = HashMap::new();
        let mut groups: Vec<(IdentityKey, Vec<Item>)> = Vec::new();

        for item in items {
            let key = item.identity_key();
            match index.get(&key) {
                Some(&slot) => groups[slot].1.push(item),
                None => {
                    index.insert(key.clone(), groups.len());
                    groups.push((key, vec![item]));
                }
            }
        }

        groups.retain(|(_, members)| members.len() >= 2);
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ids(groups: &[(IdentityKey, Vec<Item>)]) -> Vec<Vec<i64>> {
        groups
            .iter()
            .map(|(_, members)| members.iter().map(Item::item_id).collect())
            .collect()
    }

    #[test]
    fn test_groups_by_exact_key_and_drops_singletons() {
        let items = vec![
            Item::new_for_test(5, 1, "4", "Charizard"),
            Item::new_for_test(2, 1, "4", "Charizard"),
            Item::new_for_test(3, 1, "4", "charizard"),
            Item::new_for_test(4, 2, "4", "Charizard"),
            Item::new_for_test(1, 1, "1", "Alakazam"),
            Item::new_for_test(6, 1, "1", "Alakazam"),
        ];

        let groups = IdentityGrouper::group(items);
        assert_eq!(ids(&groups), vec![vec![1, 6], vec![2, 5]]);
        assert_eq!(groups[1].0.position_key, "4");
    }

    #[test]
    fn test_output_independent_of_input_order() {
        let forward = vec![
            Item::new_for_test(1, 1, "9", "Gyarados"),
            Item::new_for_test(2, 1, "9", "Gyarados"),
            Item::new_for_test(3, 1, "9", "Gyarados"),
        ];
        let mut reversed = forward.clone();
        reversed.reverse();

        assert_eq!(ids(&IdentityGrouper::group(forward)), ids(&IdentityGrouper::group(reversed)));
    }

    #[test]
    fn test_empty_input() {
        assert!(IdentityGrouper::group(Vec::new()).is_empty());
    }
}
