//! Phase timings recorded while a query is planned and executed.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Phase of query processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryPhase {
    /// Whole request.
    Overall,
    /// Building candidate plans.
    Planning,
    /// Selecting target indexes.
    PlanningIndexUsage,
    /// Translating the filter into a formula.
    PlanningFilter,
    /// Building an alternative plan for verification.
    PlanningFilterAlternative,
    /// Nested query planning (reference ordering, stop-at predicates).
    PlanningNestedQuery,
    /// Building the sorter chain.
    PlanningSort,
    /// Building extra result producers.
    PlanningExtraResultFabrication,
    /// Running the chosen plan.
    Execution,
    /// Eager loading of entity bodies.
    ExecutionPrefetch,
    /// Computing the filter formula.
    ExecutionFilter,
    /// Sorting and slicing the page.
    ExecutionSortAndSlice,
    /// Computing extra results.
    ExtraResultItemSchemaFabrication,
    /// Loading bodies of the page.
    Fetching,
    /// Loading referenced entities.
    FetchingReferences,
    /// Loading hierarchy parents.
    FetchingParents,
}

impl fmt::Display for QueryPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueryPhase::Overall => "OVERALL",
            QueryPhase::Planning => "PLANNING",
            QueryPhase::PlanningIndexUsage => "PLANNING_INDEX_USAGE",
            QueryPhase::PlanningFilter => "PLANNING_FILTER",
            QueryPhase::PlanningFilterAlternative => "PLANNING_FILTER_ALTERNATIVE",
            QueryPhase::PlanningNestedQuery => "PLANNING_NESTED_QUERY",
            QueryPhase::PlanningSort => "PLANNING_SORT",
            QueryPhase::PlanningExtraResultFabrication => "PLANNING_EXTRA_RESULT_FABRICATION",
            QueryPhase::Execution => "EXECUTION",
            QueryPhase::ExecutionPrefetch => "EXECUTION_PREFETCH",
            QueryPhase::ExecutionFilter => "EXECUTION_FILTER",
            QueryPhase::ExecutionSortAndSlice => "EXECUTION_SORT_AND_SLICE",
            QueryPhase::ExtraResultItemSchemaFabrication => "EXTRA_RESULT_FABRICATION",
            QueryPhase::Fetching => "FETCHING",
            QueryPhase::FetchingReferences => "FETCHING_REFERENCES",
            QueryPhase::FetchingParents => "FETCHING_PARENTS",
        };
        f.write_str(name)
    }
}

/// A node of the recorded phase tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryTelemetry {
    /// Recorded phase.
    pub phase: QueryPhase,
    /// Free-form arguments describing the step.
    pub arguments: Vec<String>,
    /// Time spent in the phase, including nested steps.
    pub spent_nanos: u64,
    /// Nested steps.
    pub steps: Vec<QueryTelemetry>,
}

impl QueryTelemetry {
    /// Create an empty telemetry node.
    pub fn new(phase: QueryPhase, arguments: Vec<String>) -> Self {
        Self {
            phase,
            arguments,
            spent_nanos: 0,
            steps: vec![],
        }
    }

    /// Find the first nested step (depth-first) of the given phase.
    pub fn find(&self, phase: QueryPhase) -> Option<&QueryTelemetry> {
        if self.phase == phase {
            return Some(self);
        }
        self.steps.iter().find_map(|s| s.find(phase))
    }

    /// Number of nodes in the tree.
    pub fn node_count(&self) -> usize {
        1 + self.steps.iter().map(|s| s.node_count()).sum::<usize>()
    }
}

impl fmt::Display for QueryTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn write_node(
            node: &QueryTelemetry,
            depth: usize,
            f: &mut fmt::Formatter<'_>,
        ) -> fmt::Result {
            write!(f, "{}{}", "  ".repeat(depth), node.phase)?;
            if !node.arguments.is_empty() {
                write!(f, " ({})", node.arguments.join(", "))?;
            }
            writeln!(f, ": {}us", node.spent_nanos / 1_000)?;
            for step in &node.steps {
                write_node(step, depth + 1, f)?;
            }
            Ok(())
        }
        write_node(self, 0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_nested_phase() {
        let mut root = QueryTelemetry::new(QueryPhase::Overall, vec![]);
        let mut planning = QueryTelemetry::new(QueryPhase::Planning, vec![]);
        planning
            .steps
            .push(QueryTelemetry::new(QueryPhase::PlanningSort, vec!["name".into()]));
        root.steps.push(planning);

        let sort = root.find(QueryPhase::PlanningSort).unwrap();
        assert_eq!(sort.arguments, vec!["name".to_string()]);
        assert!(root.find(QueryPhase::Fetching).is_none());
        assert_eq!(root.node_count(), 3);
    }

    #[test]
    fn test_display_indents_steps() {
        let mut root = QueryTelemetry::new(QueryPhase::Overall, vec![]);
        root.steps
            .push(QueryTelemetry::new(QueryPhase::Execution, vec![]));
        let rendered = root.to_string();
        assert!(rendered.starts_with("OVERALL: 0us\n"));
        assert!(rendered.contains("\n  EXECUTION: 0us\n"));
    }
}
