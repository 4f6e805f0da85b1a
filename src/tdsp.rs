//! Texas TDSP reference data: territory registry, ZIP lookup tables, and
//! split-ZIP boundary notes. Read-only at resolution time.

use crate::models::{BoundaryGranularity, SplitZipInfo, TdspInfo};

// DUNS identifiers the pricing API keys territories by.
pub const ONCOR_DUNS: &str = "1039940674000";
pub const CENTERPOINT_DUNS: &str = "957877905";
pub const AEP_CENTRAL_DUNS: &str = "007924772";
pub const AEP_NORTH_DUNS: &str = "007923311";
pub const TNMP_DUNS: &str = "007929441";

pub fn oncor() -> TdspInfo {
    TdspInfo {
        duns_id: ONCOR_DUNS.to_string(),
        name: "Oncor Electric Delivery".to_string(),
        zone: "North".to_string(),
    }
}

pub fn centerpoint() -> TdspInfo {
    TdspInfo {
        duns_id: CENTERPOINT_DUNS.to_string(),
        name: "CenterPoint Energy".to_string(),
        zone: "Coast".to_string(),
    }
}

pub fn aep_central() -> TdspInfo {
    TdspInfo {
        duns_id: AEP_CENTRAL_DUNS.to_string(),
        name: "AEP Texas Central".to_string(),
        zone: "South".to_string(),
    }
}

pub fn aep_north() -> TdspInfo {
    TdspInfo {
        duns_id: AEP_NORTH_DUNS.to_string(),
        name: "AEP Texas North".to_string(),
        zone: "West".to_string(),
    }
}

pub fn tnmp() -> TdspInfo {
    TdspInfo {
        duns_id: TNMP_DUNS.to_string(),
        name: "Texas-New Mexico Power".to_string(),
        zone: "Gulf".to_string(),
    }
}

/// Every territory the pricing API serves.
pub fn all_tdsps() -> Vec<TdspInfo> {
    vec![oncor(), centerpoint(), aep_central(), aep_north(), tnmp()]
}

pub fn tdsp_by_duns(duns: &str) -> Option<TdspInfo> {
    match duns {
        ONCOR_DUNS => Some(oncor()),
        CENTERPOINT_DUNS => Some(centerpoint()),
        AEP_CENTRAL_DUNS => Some(aep_central()),
        AEP_NORTH_DUNS => Some(aep_north()),
        TNMP_DUNS => Some(tnmp()),
        _ => None,
    }
}

/// The dominant territory statewide, used as the last-resort fallback.
/// Oncor serves the largest share of deregulated Texas meters.
pub fn regional_default() -> TdspInfo {
    oncor()
}

/// ZIPs verified to sit entirely inside one territory. Checked before any
/// prefix heuristics or network calls.
pub fn single_territory_zip(zip: &str) -> Option<TdspInfo> {
    match zip {
        // Dallas / Fort Worth metro
        "75201" | "75204" | "75206" | "75214" | "75230" | "75062" | "75023" | "76102"
        | "76109" => Some(oncor()),
        // Houston metro
        "77002" | "77005" | "77019" | "77056" | "77084" | "77494" => Some(centerpoint()),
        // Corpus Christi / Rio Grande Valley
        "78401" | "78412" | "78501" | "78041" => Some(aep_central()),
        // Abilene / San Angelo
        "79601" | "79605" | "76901" => Some(aep_north()),
        // Texas City / League City corridor
        "77590" | "77573" => Some(tnmp()),
        _ => None,
    }
}

/// Known split ZIPs: the boundary note plus every territory with meters
/// inside the ZIP, primary first.
pub fn split_zip(zip: &str) -> Option<(SplitZipInfo, Vec<TdspInfo>)> {
    match zip {
        "75034" => Some((
            SplitZipInfo {
                is_known_ambiguous: true,
                boundary_granularity: BoundaryGranularity::Street,
                notes: Some(
                    "Frisco: most of the ZIP is Oncor; subdivisions along the western edge \
                     are metered by Texas-New Mexico Power"
                        .to_string(),
                ),
            },
            vec![oncor(), tnmp()],
        )),
        "75056" => Some((
            SplitZipInfo {
                is_known_ambiguous: true,
                boundary_granularity: BoundaryGranularity::Street,
                notes: Some(
                    "The Colony: Oncor east of Paige Road, Texas-New Mexico Power pockets west"
                        .to_string(),
                ),
            },
            vec![oncor(), tnmp()],
        )),
        "76262" => Some((
            SplitZipInfo {
                is_known_ambiguous: true,
                boundary_granularity: BoundaryGranularity::Block,
                notes: Some(
                    "Roanoke/Trophy Club: Oncor and Texas-New Mexico Power interleave by block"
                        .to_string(),
                ),
            },
            vec![oncor(), tnmp()],
        )),
        "77414" => Some((
            SplitZipInfo {
                is_known_ambiguous: true,
                boundary_granularity: BoundaryGranularity::Block,
                notes: Some(
                    "Bay City: CenterPoint in town, AEP Texas Central on rural routes".to_string(),
                ),
            },
            vec![centerpoint(), aep_central()],
        )),
        "79356" => Some((
            SplitZipInfo {
                is_known_ambiguous: true,
                boundary_granularity: BoundaryGranularity::Zip4,
                notes: Some(
                    "Post: AEP Texas North and Oncor split along the ZIP+4 sectors".to_string(),
                ),
            },
            vec![aep_north(), oncor()],
        )),
        _ => None,
    }
}

/// Coarse ZIP-prefix (first three digits) to territory mapping. Covers the
/// major deregulated metros; municipally-served areas return None.
pub fn zip_prefix_territory(zip: &str) -> Option<TdspInfo> {
    match zip.get(..3)? {
        // Dallas, Fort Worth, Tyler, Waco and surrounding North Texas
        "750" | "751" | "752" | "753" | "754" | "756" | "757" | "758" | "759" | "760" | "761"
        | "762" | "764" | "766" | "767" => Some(oncor()),
        // Houston metro
        "770" | "771" | "772" | "773" | "774" | "775" => Some(centerpoint()),
        // Gulf coast south of Houston
        "776" | "777" => Some(tnmp()),
        // Corpus Christi, Laredo, Rio Grande Valley
        "783" | "784" | "785" => Some(aep_central()),
        // Abilene, San Angelo, Brownwood
        "768" | "769" | "795" | "796" => Some(aep_north()),
        // 786/787 (Austin Energy) and 782 (CPS Energy) are municipal, not
        // in the competitive market.
        _ => None,
    }
}

/// City-name heuristic for when only an address is usable. Input must
/// already be lowercased.
pub fn city_territory(city: &str) -> Option<TdspInfo> {
    match city {
        "dallas" | "fort worth" | "plano" | "frisco" | "irving" | "arlington" | "garland"
        | "mckinney" | "waco" | "tyler" | "midland" | "odessa" | "killeen" | "temple" => {
            Some(oncor())
        }
        "houston" | "katy" | "sugar land" | "pasadena" | "pearland" | "spring" | "baytown"
        | "humble" | "galveston" => Some(centerpoint()),
        "corpus christi" | "mcallen" | "laredo" | "harlingen" | "brownsville" | "victoria"
        | "edinburg" => Some(aep_central()),
        "abilene" | "san angelo" | "vernon" | "brownwood" => Some(aep_north()),
        "texas city" | "league city" | "lewisville west" | "dickinson" | "la marque"
        | "friendswood" | "angleton" => Some(tnmp()),
        _ => None,
    }
}

/// Whether a ZIP falls inside deregulated Texas at the coarsest level.
/// 75xxx–79xxx is the Texas band; municipal holes are handled by the
/// prefix table returning None.
pub fn in_texas_band(zip: &str) -> bool {
    matches!(zip.get(..2), Some("75") | Some("76") | Some("77") | Some("78") | Some("79"))
}

/// The municipal utility serving a ZIP inside the Texas band but outside
/// the competitive market, so errors can name it.
pub fn municipal_utility(zip: &str) -> Option<&'static str> {
    match zip.get(..3) {
        Some("786") | Some("787") => Some("Austin Energy"),
        Some("782") => Some("CPS Energy"),
        _ => None,
    }
}

/// City slugs suggested to callers whose ZIP is out of the market.
pub fn market_suggestions() -> Vec<String> {
    vec![
        "dallas-tx".to_string(),
        "houston-tx".to_string(),
        "fort-worth-tx".to_string(),
        "corpus-christi-tx".to_string(),
        "abilene-tx".to_string(),
    ]
}

/// Baseline count of marketable plans per territory, used when no fresher
/// count is cached. Updated from marketing data, not a live number.
pub fn plan_count_estimate(duns: &str) -> u32 {
    match duns {
        ONCOR_DUNS => 112,
        CENTERPOINT_DUNS => 98,
        AEP_CENTRAL_DUNS => 64,
        AEP_NORTH_DUNS => 47,
        TNMP_DUNS => 41,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duns_lookup_round_trips() {
        for t in all_tdsps() {
            let found = tdsp_by_duns(&t.duns_id).unwrap();
            assert_eq!(found, t);
        }
        assert!(tdsp_by_duns("000000000").is_none());
    }

    #[test]
    fn test_known_single_territory_zips() {
        assert_eq!(single_territory_zip("75201").unwrap().duns_id, ONCOR_DUNS);
        assert_eq!(
            single_territory_zip("77002").unwrap().duns_id,
            CENTERPOINT_DUNS
        );
        assert!(single_territory_zip("75034").is_none());
    }

    #[test]
    fn test_split_zips_are_ambiguous_with_candidates() {
        for zip in ["75034", "75056", "76262", "77414", "79356"] {
            let (info, candidates) = split_zip(zip).unwrap();
            assert!(info.is_known_ambiguous, "{zip} must be flagged ambiguous");
            assert!(candidates.len() >= 2, "{zip} needs at least two candidates");
            for c in &candidates {
                assert!(tdsp_by_duns(&c.duns_id).is_some());
            }
        }
    }

    #[test]
    fn test_prefix_mapping_skips_municipal_areas() {
        assert_eq!(zip_prefix_territory("75201").unwrap().duns_id, ONCOR_DUNS);
        assert_eq!(
            zip_prefix_territory("77005").unwrap().duns_id,
            CENTERPOINT_DUNS
        );
        // Austin and San Antonio are municipally served.
        assert!(zip_prefix_territory("78701").is_none());
        assert!(zip_prefix_territory("78205").is_none());
        // Short and non-ASCII input falls out without panicking.
        assert!(zip_prefix_territory("75").is_none());
        assert!(zip_prefix_territory("75é01").is_none());
        assert_eq!(municipal_utility("78701"), Some("Austin Energy"));
        assert_eq!(municipal_utility("78205"), Some("CPS Energy"));
        assert!(municipal_utility("75201").is_none());
    }

    #[test]
    fn test_texas_band() {
        assert!(in_texas_band("75201"));
        assert!(in_texas_band("79901"));
        assert!(!in_texas_band("12345"));
        assert!(!in_texas_band("90210"));
    }

    #[test]
    fn test_city_lookup_is_lowercase_keyed() {
        assert_eq!(city_territory("dallas").unwrap().duns_id, ONCOR_DUNS);
        assert!(city_territory("Dallas").is_none());
        assert!(city_territory("chicago").is_none());
    }

    #[test]
    fn test_default_territory_is_largest() {
        assert_eq!(regional_default().duns_id, ONCOR_DUNS);
        assert!(plan_count_estimate(ONCOR_DUNS) > plan_count_estimate(TNMP_DUNS));
    }
}
