// ============================================================
// Layer 3 — Error Rate Statistics (WER / CER)
// ============================================================
// Edit-distance scoring of hypotheses against references.
//
//   WER = 100 · (S + D + I) / N_ref_words
//   CER = same formula over characters, spaces shown as "_"
//
// Totals are accumulated over a whole stage and divided ONCE
// at the end, so every reference token weighs the same no
// matter which batch it came from.
//
// Alignment uses the classic Levenshtein table with a
// backtrace that prefers match/substitution, then deletion,
// then insertion.
//
// Reference: Levenshtein (1966)
//            NIST sclite report format

use anyhow::{bail, Result};
use std::io::{self, Write};

// ─── Alignment ────────────────────────────────────────────────────────────────
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOp {
    Equal,
    Substitution,
    Deletion,
    Insertion,
}

impl EditOp {
    fn marker(self) -> &'static str {
        match self {
            EditOp::Equal        => "=",
            EditOp::Substitution => "S",
            EditOp::Deletion     => "D",
            EditOp::Insertion    => "I",
        }
    }
}

/// One column of an alignment. Deletions have no hypothesis
/// index, insertions have no reference index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignStep {
    pub op:         EditOp,
    pub reference:  Option<usize>,
    pub hypothesis: Option<usize>,
}

/// Minimum-edit alignment turning `reference` into `hypothesis`.
pub fn align<T: PartialEq>(reference: &[T], hypothesis: &[T]) -> Vec<AlignStep> {
    let (n, m) = (reference.len(), hypothesis.len());

    // dist[i][j] = edits between reference[..i] and hypothesis[..j]
    let mut dist = vec![vec![0usize; m + 1]; n + 1];
    for (i, row) in dist.iter_mut().enumerate() { row[0] = i; }
    for j in 0..=m { dist[0][j] = j; }

    for i in 1..=n {
        for j in 1..=m {
            let diag = dist[i - 1][j - 1] + usize::from(reference[i - 1] != hypothesis[j - 1]);
            let del  = dist[i - 1][j] + 1;
            let ins  = dist[i][j - 1] + 1;
            dist[i][j] = diag.min(del).min(ins);
        }
    }

    let mut steps  = Vec::with_capacity(n.max(m));
    let (mut i, mut j) = (n, m);
    while i > 0 || j > 0 {
        if i > 0 && j > 0 {
            let same = reference[i - 1] == hypothesis[j - 1];
            if dist[i][j] == dist[i - 1][j - 1] + usize::from(!same) {
                let op = if same { EditOp::Equal } else { EditOp::Substitution };
                steps.push(AlignStep { op, reference: Some(i - 1), hypothesis: Some(j - 1) });
                i -= 1;
                j -= 1;
                continue;
            }
        }
        if i > 0 && dist[i][j] == dist[i - 1][j] + 1 {
            steps.push(AlignStep { op: EditOp::Deletion, reference: Some(i - 1), hypothesis: None });
            i -= 1;
        } else {
            steps.push(AlignStep { op: EditOp::Insertion, reference: None, hypothesis: Some(j - 1) });
            j -= 1;
        }
    }
    steps.reverse();
    steps
}

// ─── Counts ───────────────────────────────────────────────────────────────────
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EditCounts {
    pub insertions:    usize,
    pub deletions:     usize,
    pub substitutions: usize,
    pub reference_len: usize,
}

impl EditCounts {
    fn from_alignment(steps: &[AlignStep], reference_len: usize) -> Self {
        let mut c = EditCounts { reference_len, ..Default::default() };
        for s in steps {
            match s.op {
                EditOp::Equal        => {}
                EditOp::Substitution => c.substitutions += 1,
                EditOp::Deletion     => c.deletions     += 1,
                EditOp::Insertion    => c.insertions    += 1,
            }
        }
        c
    }

    pub fn errors(&self) -> usize {
        self.insertions + self.deletions + self.substitutions
    }

    fn error_rate(&self) -> f64 {
        100.0 * self.errors() as f64 / self.reference_len.max(1) as f64
    }

    fn add(&mut self, other: &EditCounts) {
        self.insertions    += other.insertions;
        self.deletions     += other.deletions;
        self.substitutions += other.substitutions;
        self.reference_len += other.reference_len;
    }
}

/// The scored alignment of a single utterance.
#[derive(Debug, Clone)]
pub struct UtteranceScore {
    pub id:         String,
    pub reference:  Vec<String>,
    pub hypothesis: Vec<String>,
    pub alignment:  Vec<AlignStep>,
    pub counts:     EditCounts,
}

/// What `summarize` should report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryKind {
    /// Percentage of erroneous tokens
    ErrorRate,
    /// Percentage of utterances with at least one error
    SentenceErrorRate,
    Insertions,
    Deletions,
    Substitutions,
    /// Number of reference tokens scored
    ScoredTokens,
}

// ─── ErrorRateStats ───────────────────────────────────────────────────────────
/// Running edit-distance statistics over one stage.
#[derive(Debug, Clone)]
pub struct ErrorRateStats {
    /// Score characters instead of words (CER)
    split_chars: bool,
    scores:      Vec<UtteranceScore>,
}

impl ErrorRateStats {
    /// Word-level statistics (WER)
    pub fn words() -> Self {
        Self { split_chars: false, scores: Vec::new() }
    }

    /// Character-level statistics (CER)
    pub fn chars() -> Self {
        Self { split_chars: true, scores: Vec::new() }
    }

    pub fn reset(&mut self) {
        self.scores.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    pub fn scores(&self) -> &[UtteranceScore] {
        &self.scores
    }

    /// Score a batch of predictions against their references.
    pub fn append(
        &mut self,
        ids:       &[String],
        predicted: &[Vec<String>],
        targets:   &[Vec<String>],
    ) -> Result<()> {
        if ids.len() != predicted.len() || ids.len() != targets.len() {
            bail!(
                "append(): {} ids, {} predictions, {} targets",
                ids.len(), predicted.len(), targets.len()
            );
        }

        for ((id, hyp), reference) in ids.iter().zip(predicted).zip(targets) {
            let (reference, hypothesis) = if self.split_chars {
                (split_chars(reference), split_chars(hyp))
            } else {
                (reference.clone(), hyp.clone())
            };
            let alignment = align(&reference, &hypothesis);
            let counts    = EditCounts::from_alignment(&alignment, reference.len());
            self.scores.push(UtteranceScore {
                id: id.clone(),
                reference,
                hypothesis,
                alignment,
                counts,
            });
        }
        Ok(())
    }

    /// Summed counts over everything appended so far.
    pub fn totals(&self) -> EditCounts {
        let mut total = EditCounts::default();
        for s in &self.scores {
            total.add(&s.counts);
        }
        total
    }

    /// Report a statistic over the whole stage.
    /// Pure: repeated calls return the same value.
    pub fn summarize(&self, kind: SummaryKind) -> Result<f64> {
        if self.scores.is_empty() {
            bail!("summarize() called before any append()");
        }
        let t = self.totals();
        let value = match kind {
            SummaryKind::ErrorRate         => t.error_rate(),
            SummaryKind::SentenceErrorRate => {
                let wrong = self.scores.iter().filter(|s| s.counts.errors() > 0).count();
                100.0 * wrong as f64 / self.scores.len() as f64
            }
            SummaryKind::Insertions        => t.insertions as f64,
            SummaryKind::Deletions         => t.deletions as f64,
            SummaryKind::Substitutions     => t.substitutions as f64,
            SummaryKind::ScoredTokens      => t.reference_len as f64,
        };
        Ok(value)
    }

    /// Write the summary line followed by per-utterance alignments.
    pub fn write_stats(&self, label: &str, w: &mut dyn Write) -> io::Result<()> {
        let t = self.totals();
        writeln!(
            w,
            "%{label} {:.2} [ {} / {}, {} ins, {} del, {} sub ]",
            t.error_rate(), t.errors(), t.reference_len,
            t.insertions, t.deletions, t.substitutions,
        )?;
        let wrong = self.scores.iter().filter(|s| s.counts.errors() > 0).count();
        writeln!(
            w,
            "%SER {:.2} [ {} / {} ]",
            100.0 * wrong as f64 / self.scores.len().max(1) as f64,
            wrong,
            self.scores.len(),
        )?;
        writeln!(w, "Scored {} utterances.", self.scores.len())?;
        writeln!(w, "{}", "=".repeat(80))?;
        writeln!(w, "ALIGNMENTS")?;
        writeln!(w)?;
        writeln!(w, "Format:")?;
        writeln!(w, "<utterance-id>, {label} DETAILS")?;
        writeln!(w, "<reference tokens>")?;
        writeln!(w, "<edit markers: = S D I>")?;
        writeln!(w, "<hypothesis tokens>")?;
        writeln!(w, "{}", "=".repeat(80))?;

        for s in &self.scores {
            let c = &s.counts;
            writeln!(
                w,
                "{}, %{label} {:.2} [ {} / {}, {} ins, {} del, {} sub ]",
                s.id, c.error_rate(), c.errors(), c.reference_len,
                c.insertions, c.deletions, c.substitutions,
            )?;
            write_alignment(s, w)?;
            writeln!(w, "{}", "=".repeat(80))?;
        }
        Ok(())
    }
}

/// Characters of the words joined by "_" (one token per char).
fn split_chars(words: &[String]) -> Vec<String> {
    words.join("_").chars().map(String::from).collect()
}

fn write_alignment(s: &UtteranceScore, w: &mut dyn Write) -> io::Result<()> {
    const EPS: &str = "<eps>";
    let mut refs  = Vec::with_capacity(s.alignment.len());
    let mut marks = Vec::with_capacity(s.alignment.len());
    let mut hyps  = Vec::with_capacity(s.alignment.len());

    for step in &s.alignment {
        let r = step.reference.map_or(EPS, |i| s.reference[i].as_str());
        let h = step.hypothesis.map_or(EPS, |j| s.hypothesis[j].as_str());
        let width = r.chars().count().max(h.chars().count());
        refs.push(format!("{r:^width$}"));
        marks.push(format!("{:^width$}", step.op.marker()));
        hyps.push(format!("{h:^width$}"));
    }

    writeln!(w, "{}", refs.join(" ; "))?;
    writeln!(w, "{}", marks.join(" ; "))?;
    writeln!(w, "{}", hyps.join(" ; "))
}

// ─── MetricAccumulator ────────────────────────────────────────────────────────
/// Which statistic family to summarise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Wer,
    Cer,
}

/// WER and CER accumulated side by side for one evaluation stage.
#[derive(Debug, Clone)]
pub struct MetricAccumulator {
    wer: ErrorRateStats,
    cer: ErrorRateStats,
}

impl Default for MetricAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricAccumulator {
    pub fn new() -> Self {
        Self { wer: ErrorRateStats::words(), cer: ErrorRateStats::chars() }
    }

    pub fn reset(&mut self) {
        self.wer.reset();
        self.cer.reset();
    }

    pub fn append(
        &mut self,
        ids:       &[String],
        predicted: &[Vec<String>],
        targets:   &[Vec<String>],
    ) -> Result<()> {
        self.wer.append(ids, predicted, targets)?;
        self.cer.append(ids, predicted, targets)
    }

    pub fn summarize(&self, metric: Metric, kind: SummaryKind) -> Result<f64> {
        match metric {
            Metric::Wer => self.wer.summarize(kind),
            Metric::Cer => self.cer.summarize(kind),
        }
    }

    /// Utterances scored since the last reset
    pub fn utterance_count(&self) -> usize {
        self.wer.scores().len()
    }

    pub fn wer(&self) -> Result<f64> {
        self.summarize(Metric::Wer, SummaryKind::ErrorRate)
    }

    pub fn cer(&self) -> Result<f64> {
        self.summarize(Metric::Cer, SummaryKind::ErrorRate)
    }

    /// The test report: CER summary, then the full WER breakdown.
    pub fn write_report(&self, w: &mut dyn Write) -> io::Result<()> {
        let c = self.cer.totals();
        writeln!(
            w,
            "%CER {:.2} [ {} / {}, {} ins, {} del, {} sub ]",
            c.error_rate(), c.errors(), c.reference_len,
            c.insertions, c.deletions, c.substitutions,
        )?;
        self.wer.write_stats("WER", w)
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    fn words(s: &str) -> Vec<String> {
        s.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn test_alignment_counts() {
        let r = words("a b c");
        let h = words("a x c d");
        let steps  = align(&r, &h);
        let counts = EditCounts::from_alignment(&steps, r.len());
        assert_eq!(counts.substitutions, 1);
        assert_eq!(counts.insertions, 1);
        assert_eq!(counts.deletions, 0);
    }

    #[test]
    fn test_alignment_empty_hypothesis() {
        let r = words("one two");
        let steps = align(&r, &Vec::<String>::new());
        assert_eq!(steps.len(), 2);
        assert!(steps.iter().all(|s| s.op == EditOp::Deletion));
    }

    #[test]
    fn test_wer_over_whole_stage() {
        let mut stats = ErrorRateStats::words();
        // batch 1: 1 error over 4 words
        stats.append(&["u1".into()], &[words("the cat sat down")], &[words("the cat sat up")]).unwrap();
        // batch 2: 0 errors over 1 word
        stats.append(&["u2".into()], &[words("hello")], &[words("hello")]).unwrap();
        // 1 / 5 = 20%, not the 12.5% a per-batch mean would give
        let wer = stats.summarize(SummaryKind::ErrorRate).unwrap();
        assert!((wer - 20.0).abs() < 1e-9);
        let ser = stats.summarize(SummaryKind::SentenceErrorRate).unwrap();
        assert!((ser - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_cer_counts_characters() {
        let mut stats = ErrorRateStats::chars();
        stats.append(&["u".into()], &[words("ab c")], &[words("ab d")]).unwrap();
        // reference "ab_d" has 4 chars, one substitution
        assert_eq!(stats.summarize(SummaryKind::ScoredTokens).unwrap(), 4.0);
        assert!((stats.summarize(SummaryKind::ErrorRate).unwrap() - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_summarize_is_idempotent() {
        let mut acc = MetricAccumulator::new();
        acc.append(&["u".into()], &[words("a b")], &[words("a c")]).unwrap();
        let first  = acc.wer().unwrap();
        let second = acc.wer().unwrap();
        assert_eq!(first.to_bits(), second.to_bits());
        assert_eq!(acc.cer().unwrap().to_bits(), acc.cer().unwrap().to_bits());
    }

    #[test]
    fn test_summarize_before_append_fails() {
        let acc = MetricAccumulator::new();
        assert!(acc.wer().is_err());
    }

    #[test]
    fn test_reset_discards_previous_stage() {
        let mut acc = MetricAccumulator::new();
        acc.append(&["u".into()], &[words("x")], &[words("y")]).unwrap();
        acc.reset();
        assert!(acc.wer().is_err());
    }

    #[test]
    fn test_mismatched_append_rejected() {
        let mut stats = ErrorRateStats::words();
        let res = stats.append(&["u".into()], &[], &[words("a")]);
        assert!(res.is_err());
    }

    #[test]
    fn test_report_contains_utterance_lines() {
        let mut acc = MetricAccumulator::new();
        acc.append(&["song_01".into()], &[words("i see")], &[words("i see you")]).unwrap();
        let mut out = Vec::new();
        acc.write_report(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("%CER"));
        assert!(text.contains("%WER 33.33 [ 1 / 3, 0 ins, 1 del, 0 sub ]"));
        assert!(text.contains("song_01, %WER"));
        assert!(text.contains("<eps>"));
    }
}
