/*!

The static, symmetric contact network.

Every undirected input edge `{a, b}` is stored as the two directed arcs `a -> b` and `b -> a`, in
compressed-sparse-row form: the neighbors of agent `i` are `targets[offsets[i]..offsets[i + 1]]`.
Because the graph is symmetric, the out-neighbors of an agent are exactly the agents that send it
messages. Self-loops and repeated edges are kept as given.

Edge files are headerless, two integer columns per line. Edges with an endpoint at or beyond the
configured agent count are dropped; anything else that is not a pair of non-negative integers is
a fatal configuration error.

*/

use crate::{
    context::{Context, DataPlugin},
    error::EpiError,
    log::{debug, info, trace},
    parameters::shared_parameters,
    AgentId,
};
use std::{fs::File, io, path::Path, rc::Rc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactGraph {
    agent_count: usize,
    offsets: Vec<usize>,
    targets: Vec<AgentId>,
    edge_count: usize,
}

impl ContactGraph {
    /// Builds the graph from undirected edges, dropping any edge with an endpoint
    /// `>= agent_count`.
    pub fn from_edges(
        agent_count: usize,
        edges: impl IntoIterator<Item = (usize, usize)>,
    ) -> Result<Self, EpiError> {
        if agent_count == 0 {
            return Err(EpiError::ConfigError("contact graph needs a positive agent count".to_string()));
        }

        let mut kept = Vec::new();
        let mut dropped = 0usize;
        for (a, b) in edges {
            if a < agent_count && b < agent_count {
                kept.push((a, b));
            } else {
                dropped += 1;
            }
        }
        if dropped > 0 {
            debug!("dropped {dropped} edges with an endpoint outside 0..{agent_count}");
        }

        // Count arcs per source, then prefix-sum into offsets.
        let mut offsets = vec![0usize; agent_count + 1];
        for &(a, b) in &kept {
            offsets[a + 1] += 1;
            offsets[b + 1] += 1;
        }
        for i in 0..agent_count {
            offsets[i + 1] += offsets[i];
        }

        let mut cursor = offsets.clone();
        let mut targets = vec![AgentId(0); 2 * kept.len()];
        for &(a, b) in &kept {
            targets[cursor[a]] = AgentId(b);
            cursor[a] += 1;
            targets[cursor[b]] = AgentId(a);
            cursor[b] += 1;
        }

        trace!("contact graph built: {} agents, {} edges", agent_count, kept.len());
        Ok(ContactGraph {
            agent_count,
            offsets,
            targets,
            edge_count: kept.len(),
        })
    }

    /// Parses headerless `a,b` lines from `reader`.
    pub fn from_reader<R: io::Read>(reader: R, agent_count: usize) -> Result<Self, EpiError> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut edges = Vec::new();
        for result in csv_reader.records() {
            let record = result?;
            let line = record.position().map_or(0, csv::Position::line);
            if record.len() != 2 {
                return Err(EpiError::ParseError(
                    line,
                    format!("expected 2 fields, found {}", record.len()),
                ));
            }
            let a = parse_index(&record[0], line)?;
            let b = parse_index(&record[1], line)?;
            edges.push((a, b));
        }

        Self::from_edges(agent_count, edges)
    }

    pub fn from_csv_path(path: impl AsRef<Path>, agent_count: usize) -> Result<Self, EpiError> {
        let path = path.as_ref();
        trace!("loading contact edges from {}", path.display());
        let file = File::open(path)?;
        Self::from_reader(file, agent_count)
    }

    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.agent_count
    }

    /// Undirected edges kept after filtering.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edge_count
    }

    /// Directed arcs, always twice the edge count.
    #[must_use]
    pub fn arc_count(&self) -> usize {
        self.targets.len()
    }

    /// The one-hop neighbors of `agent`, with multiplicity.
    #[must_use]
    #[inline]
    pub fn neighbors(&self, agent: AgentId) -> &[AgentId] {
        &self.targets[self.offsets[agent.0]..self.offsets[agent.0 + 1]]
    }

    #[must_use]
    pub fn degree(&self, agent: AgentId) -> usize {
        self.neighbors(agent).len()
    }

    /// Every directed arc as `(source, target)`.
    pub fn arcs(&self) -> impl Iterator<Item = (AgentId, AgentId)> + '_ {
        (0..self.agent_count).flat_map(move |source| {
            self.neighbors(AgentId(source))
                .iter()
                .map(move |&target| (AgentId(source), target))
        })
    }
}

fn parse_index(field: &str, line: u64) -> Result<usize, EpiError> {
    let value: i64 = field
        .parse()
        .map_err(|_| EpiError::ParseError(line, format!("{field:?} is not an integer agent index")))?;
    usize::try_from(value)
        .map_err(|_| EpiError::ParseError(line, format!("agent index {value} is negative")))
}

struct ContactGraphPlugin {
    graph: Option<Rc<ContactGraph>>,
}

impl DataPlugin for ContactGraphPlugin {
    const new: &'static dyn Fn() -> Self = &|| ContactGraphPlugin { graph: None };
}

pub trait ContextContactGraphExt {
    /// Installs the run's contact graph. Its agent count must match the parameters, and it
    /// cannot be replaced once set.
    fn set_contact_graph(&mut self, graph: ContactGraph) -> Result<(), EpiError>;

    /// Loads the edge file at `path`, filtered to the configured agent count.
    fn load_contact_graph(&mut self, path: impl AsRef<Path>) -> Result<(), EpiError>;

    fn get_contact_graph(&self) -> Option<&ContactGraph>;
}

impl ContextContactGraphExt for Context {
    fn set_contact_graph(&mut self, graph: ContactGraph) -> Result<(), EpiError> {
        let parameters = shared_parameters(self)?;
        if graph.agent_count() != parameters.agent_count {
            return Err(EpiError::ConfigError(format!(
                "contact graph covers {} agents but the parameters configure {}",
                graph.agent_count(),
                parameters.agent_count
            )));
        }

        let plugin = self.get_data_container_mut::<ContactGraphPlugin>();
        if plugin.graph.is_some() {
            return Err(EpiError::StateError("contact graph has already been set".to_string()));
        }
        info!("contact graph: {} edges over {} agents", graph.edge_count(), graph.agent_count());
        plugin.graph = Some(Rc::new(graph));
        Ok(())
    }

    fn load_contact_graph(&mut self, path: impl AsRef<Path>) -> Result<(), EpiError> {
        let agent_count = shared_parameters(self)?.agent_count;
        let graph = ContactGraph::from_csv_path(path, agent_count)?;
        self.set_contact_graph(graph)
    }

    fn get_contact_graph(&self) -> Option<&ContactGraph> {
        self.get_data_container::<ContactGraphPlugin>()
            .and_then(|plugin| plugin.graph.as_deref())
    }
}

pub(crate) fn shared_contact_graph(context: &Context) -> Result<Rc<ContactGraph>, EpiError> {
    context
        .get_data_container::<ContactGraphPlugin>()
        .and_then(|plugin| plugin.graph.clone())
        .ok_or_else(|| EpiError::StateError("contact graph has not been set".to_string()))
}
