//! Grouping search: which combination of signal regions excludes best.
//!
//! A [`Taxonomy`] lists, per detector, which analyses may be combined as a
//! whole and which must be split into orthogonal pairs. Every other analysis
//! of a detector contributes its regions one at a time. The search evaluates
//! all candidates with a [`RegionCombiner`] and keeps the highest
//! `r_exp_cons` per detector, for the best single region, and for the
//! cross-detector combination.

use crate::combine::{OverlapPolicy, RegionCombiner, RejectDuplicates};
use sc_core::types::{LuminosityFactor, SignalRegionYield};
use sc_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// How detectors are combined with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossDetectorMode {
    /// Union of each detector's best candidate.
    #[default]
    BestUnion,
    /// Every choice of one candidate per detector; the best union wins.
    AllPairs,
}

/// Selects regions of an analysis by exact name or name prefix.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegionSelector {
    /// Exact region names
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,
    /// Region-name prefix
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

impl RegionSelector {
    /// Match any of `names`.
    pub fn names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { names: names.into_iter().map(Into::into).collect(), prefix: None }
    }

    /// Match names starting with `prefix`.
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self { names: Vec::new(), prefix: Some(prefix.into()) }
    }

    /// Does `region` match?
    pub fn matches(&self, region: &str) -> bool {
        self.names.iter().any(|n| n == region)
            || self.prefix.as_deref().is_some_and(|p| region.starts_with(p))
    }

    fn is_empty(&self) -> bool {
        self.names.is_empty() && self.prefix.is_none()
    }
}

/// Grouping rule for one analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GroupingRule {
    /// All regions of the analysis form a single candidate.
    WholeAnalysis {
        /// Analysis identifier
        analysis: String,
    },
    /// Each `first` region paired with each `second` region; regions matching
    /// neither side are never used.
    PairedSplit {
        /// Analysis identifier
        analysis: String,
        /// One side of the pair
        first: RegionSelector,
        /// Other side of the pair
        second: RegionSelector,
    },
}

impl GroupingRule {
    /// Analysis the rule claims.
    pub fn analysis(&self) -> &str {
        match self {
            GroupingRule::WholeAnalysis { analysis }
            | GroupingRule::PairedSplit { analysis, .. } => analysis,
        }
    }
}

/// Grouping rules of one detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DetectorRules {
    /// Detector label, used in output columns (`Best_<name>`)
    pub name: String,
    /// Analyses starting with this prefix belong to the detector
    pub analysis_prefix: String,
    /// Special groupings; unlisted analyses contribute single regions
    #[serde(default)]
    pub rules: Vec<GroupingRule>,
}

impl DetectorRules {
    /// Candidate groupings as index lists into `regions`.
    ///
    /// Order: `whole_analysis` rules, then `paired_split` products, then the
    /// single regions of unclaimed analyses, each in table order.
    pub fn candidates(&self, regions: &[SignalRegionYield]) -> Vec<Vec<usize>> {
        let mut out = Vec::new();
        let of = |analysis: &str| -> Vec<usize> {
            regions
                .iter()
                .enumerate()
                .filter(|(_, r)| r.analysis == analysis)
                .map(|(i, _)| i)
                .collect()
        };

        for rule in &self.rules {
            if let GroupingRule::WholeAnalysis { analysis } = rule {
                let members = of(analysis);
                if !members.is_empty() {
                    out.push(members);
                }
            }
        }

        for rule in &self.rules {
            if let GroupingRule::PairedSplit { analysis, first, second } = rule {
                let members = of(analysis);
                let pick = |sel: &RegionSelector| -> Vec<usize> {
                    members.iter().copied().filter(|&i| sel.matches(&regions[i].region)).collect()
                };
                let (lhs, rhs) = (pick(first), pick(second));
                for &i in &lhs {
                    for &j in &rhs {
                        out.push(vec![i, j]);
                    }
                }
            }
        }

        let claimed: HashSet<&str> = self.rules.iter().map(GroupingRule::analysis).collect();
        for (i, r) in regions.iter().enumerate() {
            let unclaimed = !claimed.contains(r.analysis.as_str());
            if unclaimed && r.analysis.starts_with(&self.analysis_prefix) {
                out.push(vec![i]);
            }
        }
        out
    }
}

/// Detectors and their grouping rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Taxonomy {
    /// Cross-detector combination mode
    #[serde(default)]
    pub cross_detector: CrossDetectorMode,
    /// Detectors, in output order
    pub detectors: Vec<DetectorRules>,
}

impl Default for Taxonomy {
    fn default() -> Self {
        Self::checkmate_default()
    }
}

impl Taxonomy {
    /// ATLAS and CMS groupings for the CheckMATE analyses of the top-partner study.
    pub fn checkmate_default() -> Self {
        let whole = |a: &str| GroupingRule::WholeAnalysis { analysis: a.to_string() };
        Self {
            cross_detector: CrossDetectorMode::BestUnion,
            detectors: vec![
                DetectorRules {
                    name: "ATLAS".to_string(),
                    analysis_prefix: "atlas_".to_string(),
                    rules: vec![
                        whole("atlas_2004_14060"),
                        whole("atlas_2101_01629"),
                        GroupingRule::PairedSplit {
                            analysis: "atlas_2211_08028".to_string(),
                            first: RegionSelector::names([
                                "SR-Gtb-C",
                                "SR-Gtb-M",
                                "SR-Gtb-B",
                                "SR-Gbb-C",
                                "SR-Gbb-M",
                                "SR-Gtt-0L-B",
                            ]),
                            second: RegionSelector::prefix("SR-Gtt-1L"),
                        },
                    ],
                },
                DetectorRules {
                    name: "CMS".to_string(),
                    analysis_prefix: "cms_".to_string(),
                    rules: vec![whole("cms_1908_04722"), whole("cms_sus_19_005")],
                },
            ],
        }
    }

    /// Reject blank or duplicate detector names and empty pair selectors.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for det in &self.detectors {
            if det.name.trim().is_empty() {
                return Err(Error::Validation("detector name must not be empty".to_string()));
            }
            if !names.insert(det.name.as_str()) {
                return Err(Error::Validation(format!("duplicate detector '{}'", det.name)));
            }
            for rule in &det.rules {
                if let GroupingRule::PairedSplit { analysis, first, second } = rule {
                    if first.is_empty() || second.is_empty() {
                        return Err(Error::Validation(format!(
                            "paired_split for '{}' needs names or a prefix on both sides",
                            analysis
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Detector names in output order.
    pub fn detector_names(&self) -> Vec<&str> {
        self.detectors.iter().map(|d| d.name.as_str()).collect()
    }
}

/// One evaluated grouping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// `analysis:region` labels
    pub regions: Vec<String>,
    /// Combined `r_exp_cons`
    pub r_exp_cons: f64,
    /// Combined expected limit
    pub s95exp: f64,
}

/// Best candidate of one detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorSummary {
    /// Detector name
    pub name: String,
    /// `None` when the table holds no region of this detector
    pub best: Option<Candidate>,
}

/// Result of the grouping search for one model point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointSummary {
    /// Best single region over the whole table
    pub best_individual: Candidate,
    /// Best candidate per detector, in taxonomy order
    pub detectors: Vec<DetectorSummary>,
    /// Best cross-detector combination
    pub combined: Option<Candidate>,
    /// Highest `r_exp_cons` of everything above
    pub overall_best: Candidate,
}

impl PointSummary {
    /// Best candidate of detector `name`.
    pub fn detector(&self, name: &str) -> Option<&Candidate> {
        self.detectors.iter().find(|d| d.name == name).and_then(|d| d.best.as_ref())
    }
}

/// Evaluates a [`Taxonomy`] over region tables.
#[derive(Debug, Clone)]
pub struct GroupingSearch<P: OverlapPolicy = RejectDuplicates> {
    taxonomy: Taxonomy,
    combiner: RegionCombiner<P>,
}

impl<P: OverlapPolicy> GroupingSearch<P> {
    /// Search with a validated taxonomy.
    pub fn new(taxonomy: Taxonomy, combiner: RegionCombiner<P>) -> Result<Self> {
        taxonomy.validate()?;
        Ok(Self { taxonomy, combiner })
    }

    /// Taxonomy in use.
    pub fn taxonomy(&self) -> &Taxonomy {
        &self.taxonomy
    }

    /// Combiner in use.
    pub fn combiner(&self) -> &RegionCombiner<P> {
        &self.combiner
    }

    /// Best groupings of `regions` at luminosity factor `k`.
    ///
    /// Any candidate failing to evaluate fails the whole point.
    pub fn evaluate(
        &self,
        regions: &[SignalRegionYield],
        k: LuminosityFactor,
    ) -> Result<PointSummary> {
        if regions.is_empty() {
            return Err(Error::EmptyGrouping);
        }
        let mut eval = Evaluator { regions, k, combiner: &self.combiner, cache: HashMap::new() };

        let mut best_individual: Option<(Vec<usize>, Candidate)> = None;
        for i in 0..regions.len() {
            keep_better(&mut best_individual, vec![i], eval.candidate(&[i])?);
        }
        let (_, best_individual) =
            best_individual.ok_or_else(|| Error::Computation("no region evaluated".to_string()))?;

        let mut detector_bests: Vec<Option<(Vec<usize>, Candidate)>> = Vec::new();
        let mut detector_candidates = Vec::new();
        for det in &self.taxonomy.detectors {
            let candidates = det.candidates(regions);
            let mut best = None;
            for idx in &candidates {
                keep_better(&mut best, idx.clone(), eval.candidate(idx)?);
            }
            log::debug!(
                "{}: {} candidates, best r={:?}",
                det.name,
                candidates.len(),
                best.as_ref().map(|(_, c)| c.r_exp_cons)
            );
            detector_bests.push(best);
            detector_candidates.push(candidates);
        }

        let combined = match self.taxonomy.cross_detector {
            CrossDetectorMode::BestUnion => {
                let union: Vec<usize> = detector_bests
                    .iter()
                    .flatten()
                    .flat_map(|(idx, _)| idx.iter().copied())
                    .collect();
                if union.is_empty() { None } else { Some(eval.candidate(&union)?) }
            }
            CrossDetectorMode::AllPairs => eval.best_product(&detector_candidates)?,
        };

        let detectors: Vec<DetectorSummary> = self
            .taxonomy
            .detectors
            .iter()
            .zip(detector_bests)
            .map(|(det, best)| DetectorSummary {
                name: det.name.clone(),
                best: best.map(|(_, c)| c),
            })
            .collect();

        let mut overall = best_individual.clone();
        for c in detectors.iter().filter_map(|d| d.best.as_ref()).chain(combined.as_ref()) {
            if c.r_exp_cons > overall.r_exp_cons {
                overall = c.clone();
            }
        }

        Ok(PointSummary { best_individual, detectors, combined, overall_best: overall })
    }
}

fn keep_better(best: &mut Option<(Vec<usize>, Candidate)>, idx: Vec<usize>, c: Candidate) {
    if best.as_ref().is_none_or(|(_, b)| c.r_exp_cons > b.r_exp_cons) {
        *best = Some((idx, c));
    }
}

/// Memoized candidate evaluation for one table.
struct Evaluator<'a, P: OverlapPolicy> {
    regions: &'a [SignalRegionYield],
    k: LuminosityFactor,
    combiner: &'a RegionCombiner<P>,
    cache: HashMap<Vec<usize>, Candidate>,
}

impl<P: OverlapPolicy> Evaluator<'_, P> {
    fn candidate(&mut self, idx: &[usize]) -> Result<Candidate> {
        if let Some(c) = self.cache.get(idx) {
            return Ok(c.clone());
        }
        let members: Vec<&SignalRegionYield> = idx.iter().map(|&i| &self.regions[i]).collect();
        let result = self.combiner.combine_at(&members, self.k)?;
        let c = Candidate {
            regions: members.iter().map(|r| r.label()).collect(),
            r_exp_cons: result.r_exp_cons,
            s95exp: result.s95exp,
        };
        self.cache.insert(idx.to_vec(), c.clone());
        Ok(c)
    }

    /// Best union over one candidate per detector; `None` if a detector has none.
    fn best_product(&mut self, per_detector: &[Vec<Vec<usize>>]) -> Result<Option<Candidate>> {
        if per_detector.is_empty() || per_detector.iter().any(Vec::is_empty) {
            return Ok(None);
        }
        let mut choice = vec![0usize; per_detector.len()];
        let mut best: Option<(Vec<usize>, Candidate)> = None;
        loop {
            let union: Vec<usize> = choice
                .iter()
                .zip(per_detector)
                .flat_map(|(&c, cands)| cands[c].iter().copied())
                .collect();
            let cand = self.candidate(&union)?;
            keep_better(&mut best, union, cand);

            // Odometer over the detector choices, last detector fastest.
            let mut d = per_detector.len();
            loop {
                if d == 0 {
                    return Ok(best.map(|(_, c)| c));
                }
                d -= 1;
                choice[d] += 1;
                if choice[d] < per_detector[d].len() {
                    break;
                }
                choice[d] = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limit::LimitCalculator;

    const DEFAULT_YAML: &str = r#"
cross_detector: best_union
detectors:
  - name: ATLAS
    analysis_prefix: atlas_
    rules:
      - { kind: whole_analysis, analysis: atlas_2004_14060 }
      - { kind: whole_analysis, analysis: atlas_2101_01629 }
      - kind: paired_split
        analysis: atlas_2211_08028
        first:  { names: [SR-Gtb-C, SR-Gtb-M, SR-Gtb-B, SR-Gbb-C, SR-Gbb-M, SR-Gtt-0L-B] }
        second: { prefix: SR-Gtt-1L }
  - name: CMS
    analysis_prefix: cms_
    rules:
      - { kind: whole_analysis, analysis: cms_1908_04722 }
      - { kind: whole_analysis, analysis: cms_sus_19_005 }
"#;

    fn sr(analysis: &str, region: &str, s: f64, b: f64) -> SignalRegionYield {
        SignalRegionYield::new(analysis, region, s, 0.1 * s, b, 0.2 * b)
    }

    fn table() -> Vec<SignalRegionYield> {
        vec![
            sr("atlas_2004_14060", "SRA-TT", 6.0, 12.0),
            sr("atlas_2004_14060", "SRB-TW", 4.0, 20.0),
            sr("atlas_2211_08028", "SR-Gtb-C", 3.0, 5.0),
            sr("atlas_2211_08028", "SR-Gtt-1L-B", 5.0, 4.0),
            sr("atlas_2211_08028", "SR-Gbb-M", 2.0, 6.0),
            sr("atlas_2211_08028", "SR-Gtt-1L-M1", 1.5, 3.0),
            sr("atlas_2211_08028", "SR-Gtt-0L-M1", 9.0, 2.0),
            sr("atlas_1908_03122", "SR-bb", 7.0, 9.0),
            sr("cms_sus_19_005", "HT-1", 3.0, 10.0),
            sr("cms_sus_19_005", "HT-2", 2.0, 3.0),
            sr("cms_2107_13021", "SR-mono", 4.0, 40.0),
            sr("lhcb_2001_00001", "SR-x", 1.0, 4.0),
        ]
    }

    fn search(mode: CrossDetectorMode) -> GroupingSearch {
        let taxonomy = Taxonomy { cross_detector: mode, ..Taxonomy::checkmate_default() };
        GroupingSearch::new(taxonomy, RegionCombiner::new(LimitCalculator::default())).unwrap()
    }

    #[test]
    fn test_default_taxonomy_matches_documented_yaml() {
        let parsed: Taxonomy = serde_yaml_ng::from_str(DEFAULT_YAML).unwrap();
        assert_eq!(parsed, Taxonomy::checkmate_default());
        let echoed = serde_yaml_ng::to_string(&parsed).unwrap();
        let reparsed: Taxonomy = serde_yaml_ng::from_str(&echoed).unwrap();
        assert_eq!(reparsed, parsed);
    }

    #[test]
    fn test_taxonomy_validation() {
        let mut dup = Taxonomy::checkmate_default();
        dup.detectors[1].name = "ATLAS".to_string();
        assert!(dup.validate().is_err());

        let mut empty_side = Taxonomy::checkmate_default();
        if let GroupingRule::PairedSplit { second, .. } = &mut empty_side.detectors[0].rules[2] {
            *second = RegionSelector::default();
        }
        assert!(empty_side.validate().is_err());
    }

    #[test]
    fn test_atlas_candidates() {
        let t = table();
        let atlas = &Taxonomy::checkmate_default().detectors[0];
        let cands = atlas.candidates(&t);
        assert_eq!(
            cands,
            vec![
                vec![0, 1], // atlas_2004_14060 whole
                vec![2, 3], // Gtb-C x Gtt-1L-B
                vec![2, 5], // Gtb-C x Gtt-1L-M1
                vec![4, 3], // Gbb-M x Gtt-1L-B
                vec![4, 5], // Gbb-M x Gtt-1L-M1
                vec![7],    // unclaimed ATLAS analysis
            ]
        );
    }

    #[test]
    fn test_cms_candidates() {
        let t = table();
        let cms = &Taxonomy::checkmate_default().detectors[1];
        assert_eq!(cms.candidates(&t), vec![vec![8, 9], vec![10]]);
    }

    #[test]
    fn test_paired_split_needs_both_sides() {
        let t = vec![sr("atlas_2211_08028", "SR-Gtb-C", 3.0, 5.0)];
        let atlas = &Taxonomy::checkmate_default().detectors[0];
        assert!(atlas.candidates(&t).is_empty());
    }

    fn brute_best(
        s: &GroupingSearch,
        regions: &[SignalRegionYield],
        sets: &[Vec<usize>],
    ) -> Option<f64> {
        let k = LuminosityFactor::IDENTITY;
        sets.iter()
            .map(|idx| {
                let members: Vec<&SignalRegionYield> = idx.iter().map(|&i| &regions[i]).collect();
                s.combiner().combined_r(&members, k).unwrap()
            })
            .fold(None, |acc: Option<f64>, r| Some(acc.map_or(r, |a| a.max(r))))
    }

    #[test]
    fn test_best_union_matches_brute_force() {
        let t = table();
        let s = search(CrossDetectorMode::BestUnion);
        let summary = s.evaluate(&t, LuminosityFactor::IDENTITY).unwrap();

        let singles: Vec<Vec<usize>> = (0..t.len()).map(|i| vec![i]).collect();
        let best_single = brute_best(&s, &t, &singles).unwrap();
        assert_eq!(summary.best_individual.r_exp_cons, best_single);

        let atlas = s.taxonomy().detectors[0].candidates(&t);
        let cms = s.taxonomy().detectors[1].candidates(&t);
        assert_eq!(
            summary.detector("ATLAS").unwrap().r_exp_cons,
            brute_best(&s, &t, &atlas).unwrap()
        );
        assert_eq!(summary.detector("CMS").unwrap().r_exp_cons, brute_best(&s, &t, &cms).unwrap());

        let combined = summary.combined.as_ref().unwrap();
        let n_atlas = summary.detector("ATLAS").unwrap().regions.len();
        let n_cms = summary.detector("CMS").unwrap().regions.len();
        assert_eq!(combined.regions.len(), n_atlas + n_cms);

        let overall = [
            summary.best_individual.r_exp_cons,
            summary.detector("ATLAS").unwrap().r_exp_cons,
            summary.detector("CMS").unwrap().r_exp_cons,
            combined.r_exp_cons,
        ]
        .into_iter()
        .fold(f64::NEG_INFINITY, f64::max);
        assert_eq!(summary.overall_best.r_exp_cons, overall);
    }

    #[test]
    fn test_all_pairs_matches_brute_force() {
        let t = table();
        let s = search(CrossDetectorMode::AllPairs);
        let summary = s.evaluate(&t, LuminosityFactor::IDENTITY).unwrap();

        let atlas = s.taxonomy().detectors[0].candidates(&t);
        let cms = s.taxonomy().detectors[1].candidates(&t);
        let products: Vec<Vec<usize>> = atlas
            .iter()
            .flat_map(|a| cms.iter().map(move |c| a.iter().chain(c).copied().collect()))
            .collect();
        assert_eq!(products.len(), atlas.len() * cms.len());
        let expected = brute_best(&s, &t, &products).unwrap();
        assert_eq!(summary.combined.unwrap().r_exp_cons, expected);
    }

    #[test]
    fn test_missing_detector() {
        let t: Vec<SignalRegionYield> =
            table().into_iter().filter(|r| r.analysis.starts_with("atlas_")).collect();

        let union =
            search(CrossDetectorMode::BestUnion).evaluate(&t, LuminosityFactor::IDENTITY).unwrap();
        assert!(union.detector("CMS").is_none());
        let atlas = union.detector("ATLAS").unwrap();
        let combined = union.combined.as_ref().unwrap();
        assert_eq!(combined.regions, atlas.regions);
        assert_eq!(combined.r_exp_cons, atlas.r_exp_cons);

        let pairs =
            search(CrossDetectorMode::AllPairs).evaluate(&t, LuminosityFactor::IDENTITY).unwrap();
        assert!(pairs.combined.is_none());
    }

    #[test]
    fn test_region_outside_every_detector_counts_individually() {
        let t = vec![sr("lhcb_2001_00001", "SR-x", 8.0, 2.0)];
        let summary =
            search(CrossDetectorMode::BestUnion).evaluate(&t, LuminosityFactor::IDENTITY).unwrap();
        assert!(summary.detectors.iter().all(|d| d.best.is_none()));
        assert!(summary.combined.is_none());
        assert_eq!(summary.overall_best, summary.best_individual);
        assert_eq!(summary.best_individual.regions, vec!["lhcb_2001_00001:SR-x".to_string()]);
    }

    #[test]
    fn test_empty_table_and_failing_candidate() {
        let s = search(CrossDetectorMode::BestUnion);
        assert!(matches!(s.evaluate(&[], LuminosityFactor::IDENTITY), Err(Error::EmptyGrouping)));

        let bad = vec![sr("atlas_x", "SR", 1.0, 0.0)];
        let err = s.evaluate(&bad, LuminosityFactor::IDENTITY).unwrap_err();
        assert!(matches!(err.root(), Error::InvalidModel(_)), "{err}");
    }
}
