use super::{ManagedEndpoint, TaiArea, TaiRestriction};

/// Forbid `tac` under `plmn` on `endpoint`.
///
/// Set-like: a TAC already listed is not added again. Returns whether the
/// endpoint changed.
pub fn add_tac_restriction(endpoint: &mut ManagedEndpoint, tac: u32, plmn: &str) -> bool {
    let tais = endpoint.forbidden_5gs_tais.get_or_insert_with(Vec::new);

    let Some(entry) = tais.iter_mut().find(|tai| tai.plmn == plmn) else {
        tais.push(TaiRestriction {
            plmn: plmn.to_string(),
            areas: vec![TaiArea { tacs: vec![tac] }],
        });
        return true;
    };

    if entry.areas.is_empty() {
        entry.areas.push(TaiArea { tacs: vec![tac] });
        return true;
    }

    let mut changed = false;
    for area in entry.areas.iter_mut() {
        if !area.tacs.contains(&tac) {
            area.tacs.push(tac);
            changed = true;
        }
    }
    changed
}
