//! Repository-style access to one entity.
//!
//! A [`Repository`] owns the entity's criteria stack and hands out [`Query`]
//! builders. A query folds, in order, the stacked criteria, the criteria pushed
//! on the query itself, and the resolved request parameters into one predicate,
//! then runs it through the cache coordinator (when configured) and the engine.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};

use crate::application::builder::PredicateBuilder;
use crate::application::criteria::{
    Criteria, CriteriaContext, CriteriaScope, CriteriaStack, CriterionId,
};
use crate::application::error::{QueryError, RequestError};
use crate::application::repos::{
    EngineError, OrderBy, Page, Pagination, QueryEngine, QuerySpec, SortDirection,
};
use crate::application::request::{QueryParams, RequestCriteria};
use crate::application::resolver::FieldResolver;
use crate::cache::{CacheCoordinator, CacheOperation, InvalidationEvent, OperationKind};
use crate::domain::fields::FieldPath;
use crate::domain::operators::OperatorKind;
use crate::domain::predicate::{Condition, PredicateNode};
use crate::domain::schema::EntitySchema;
use crate::domain::values::Value;

pub struct Repository<E: QueryEngine> {
    resolver: FieldResolver,
    engine: Arc<E>,
    cache: Option<Arc<CacheCoordinator>>,
    criteria: CriteriaStack,
}

impl<E: QueryEngine> Repository<E> {
    pub fn new(resolver: FieldResolver, engine: Arc<E>) -> Self {
        Self {
            resolver,
            engine,
            cache: None,
            criteria: CriteriaStack::new(),
        }
    }

    pub fn with_cache(mut self, cache: Arc<CacheCoordinator>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn schema(&self) -> &EntitySchema {
        self.resolver.schema()
    }

    pub fn resolver(&self) -> &FieldResolver {
        &self.resolver
    }

    pub fn push_criteria(&mut self, criteria: Criteria) -> CriterionId {
        self.criteria.push(criteria)
    }

    pub fn pop_criteria(&mut self, id: CriterionId) -> Option<Criteria> {
        self.criteria.pop(id)
    }

    pub fn clear_criteria(&mut self) {
        self.criteria.clear();
    }

    /// Ignore every criterion on the next terminal operation only.
    pub fn skip_criteria(&mut self, skip: bool) {
        self.criteria.skip(skip);
    }

    pub fn criteria(&self) -> &CriteriaStack {
        &self.criteria
    }

    pub fn query(&mut self) -> Query<'_, E> {
        Query {
            repo: self,
            local: Vec::new(),
            request: None,
            context: CriteriaContext::default(),
        }
    }

    /// Purge cached results affected by a write to this entity.
    pub fn on_write(&self, event: &InvalidationEvent) -> BTreeSet<String> {
        match &self.cache {
            Some(cache) => cache.on_invalidation(event),
            None => BTreeSet::new(),
        }
    }
}

/// What a terminal operation would run, without running it.
#[derive(Debug, Clone, Serialize)]
pub struct QueryPlan {
    pub operation: OperationKind,
    /// Rendered predicate, `None` when the query matches every record.
    pub predicate: Option<String>,
    pub query: QuerySpec,
    pub criteria: Vec<CriterionId>,
    pub cached: bool,
    pub cache_key: Option<String>,
    pub cache_tags: BTreeSet<String>,
}

/// One call chain against a repository. Consumed by its terminal operation.
pub struct Query<'r, E: QueryEngine> {
    repo: &'r mut Repository<E>,
    local: Vec<Criteria>,
    /// Request-derived criterion, applied after the stack and local criteria.
    request: Option<(CriterionId, RequestCriteria)>,
    context: CriteriaContext,
}

impl<'r, E: QueryEngine> Query<'r, E> {
    /// Apply the request grammars in `params`.
    pub fn request(mut self, params: &QueryParams) -> Result<Self, RequestError> {
        let criteria = RequestCriteria::from_params(params, &self.repo.resolver)?;
        self.request = Some((CriterionId::new(), criteria));
        Ok(self)
    }

    /// Push a criterion for this query only, after the repository's stack.
    pub fn push(mut self, criteria: Criteria) -> Self {
        self.local.push(criteria);
        self
    }

    pub fn order_by(mut self, field: FieldPath, direction: SortDirection) -> Self {
        self.context.order_by.push(OrderBy { field, direction });
        self
    }

    pub fn with<I, S>(mut self, relations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.context
            .includes
            .extend(relations.into_iter().map(Into::into));
        self
    }

    pub fn with_count<I, S>(mut self, relations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.context.counts.extend(relations.into_iter().map(Into::into));
        self
    }

    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.context.columns.extend(columns.into_iter().map(Into::into));
        self
    }

    pub fn skip_cache(mut self, skip: bool) -> Self {
        self.context.skip_cache = skip;
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.context.cache_ttl = Some(ttl);
        self
    }

    /// Use `key` verbatim instead of a computed key. The caller owns its uniqueness.
    pub fn cache_key(mut self, key: impl Into<String>) -> Self {
        self.context.cache_key_override = Some(key.into());
        self
    }

    pub fn skip_criteria(mut self, skip: bool) -> Self {
        self.context.skip_criteria = skip;
        self
    }

    #[instrument(skip_all, fields(entity = self.repo.schema().name()))]
    pub fn all(self) -> Result<Vec<E::Row>, QueryError> {
        let (repo, query, context) = self.finish(&CacheOperation::All, true);
        repo.run(&query, &context, CacheOperation::All, |engine| {
            engine.fetch(&query)
        })
    }

    #[instrument(skip_all, fields(entity = self.repo.schema().name(), id = id))]
    pub fn find(self, id: u64) -> Result<Option<E::Row>, QueryError> {
        let operation = CacheOperation::Find(id);
        let (repo, query, context) = self.finish(&operation, true);
        repo.run(&query, &context, operation, |engine| {
            Ok(engine.fetch(&query)?.into_iter().next())
        })
    }

    /// [`Query::find`] by opaque token. A token that does not decode is
    /// rejected whatever the resolution policy.
    pub fn find_token(self, token: &str) -> Result<Option<E::Row>, QueryError> {
        let resolver = &self.repo.resolver;
        let id = resolver.decode_identifier(resolver.schema().primary_key(), token)?;
        self.find(id)
    }

    #[instrument(skip_all, fields(entity = self.repo.schema().name(), page = pagination.page.get()))]
    pub fn paginate(self, pagination: Pagination) -> Result<Page<E::Row>, QueryError> {
        let operation = CacheOperation::Paginate(pagination);
        let (repo, query, context) = self.finish(&operation, true);
        repo.run(&query, &context, operation, |engine| {
            engine.paginate(&query, pagination)
        })
    }

    /// Describe what `operation` would run. Executes nothing and leaves the
    /// repository's one-shot skip flag for the next terminal call.
    pub fn plan(self, operation: CacheOperation) -> QueryPlan {
        let (repo, query, context) = self.finish(&operation, false);
        let cache = repo.cache_for(&context, operation.kind());
        let request = cache.map(|cache| cache.plan(&query, &context, &operation));
        QueryPlan {
            operation: operation.kind(),
            predicate: query.predicate.as_ref().map(ToString::to_string),
            criteria: context.stack.clone(),
            cached: request.is_some(),
            cache_key: request.as_ref().map(|request| request.key.clone()),
            cache_tags: request.map(|request| request.tags).unwrap_or_default(),
            query,
        }
    }

    /// Fold everything configured on this chain into the engine's query.
    ///
    /// `consume_skip` resets the repository's one-shot skip flag.
    fn finish(
        self,
        operation: &CacheOperation,
        consume_skip: bool,
    ) -> (&'r Repository<E>, QuerySpec, CriteriaContext) {
        let Query {
            repo,
            local,
            request,
            mut context,
        } = self;

        context.skip_criteria |= if consume_skip {
            repo.criteria.take_skip()
        } else {
            repo.criteria.is_skipping()
        };
        let repo: &'r Repository<E> = repo;
        let schema: &EntitySchema = repo.resolver.schema();
        let scope = CriteriaScope { schema };

        let mut builder = PredicateBuilder::new();
        if !context.skip_criteria {
            for criteria in repo.criteria.iter().chain(local.iter()) {
                context.stack.push(criteria.id());
                builder = builder.and(criteria.contribute(&scope));
            }
            if let Some((id, request)) = request {
                context.stack.push(id);
                builder = builder.and(request.predicate);
                context.order_by.extend(request.order_by);
                context.includes.extend(request.includes);
                context.counts.extend(request.counts);
                context.skip_cache |= request.skip_cache;
            }
        } else {
            debug!("Criteria skipped for this operation");
        }
        if let CacheOperation::Find(id) = operation {
            builder = builder.and(Some(PredicateNode::leaf(Condition::field(
                FieldPath::single(schema.primary_key()),
                OperatorKind::Eq,
                vec![Value::Id(*id)],
            ))));
        }

        let query = QuerySpec {
            entity: schema.name().to_string(),
            predicate: builder.build(),
            order_by: context.order_by.clone(),
            includes: context.includes.clone(),
            counts: context.counts.clone(),
            columns: context.columns.clone(),
        };
        (repo, query, context)
    }
}

impl<E: QueryEngine> Repository<E> {
    fn cache_for(
        &self,
        context: &CriteriaContext,
        operation: OperationKind,
    ) -> Option<&Arc<CacheCoordinator>> {
        self.cache
            .as_ref()
            .filter(|cache| !context.skip_cache && cache.caches(operation))
    }

    fn run<T, F>(
        &self,
        query: &QuerySpec,
        context: &CriteriaContext,
        operation: CacheOperation,
        execute: F,
    ) -> Result<T, QueryError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&E) -> Result<T, EngineError>,
    {
        match &query.predicate {
            Some(predicate) => debug!(predicate = %predicate, "Executing query"),
            None => debug!("Executing unfiltered query"),
        }
        let engine = self.engine.as_ref();
        let result = match self.cache_for(context, operation.kind()) {
            Some(cache) => {
                let request = cache.plan(query, context, &operation);
                cache.remember(&request, || execute(engine))
            }
            None => execute(engine),
        };
        Ok(result?)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::application::resolver::ResolutionPolicy;
    use crate::cache::CacheConfig;
    use crate::domain::opaque_id::{CodecParams, OpaqueIdCodec};
    use crate::domain::schema::FieldSpec;

    #[derive(Default)]
    struct RecordingEngine {
        calls: AtomicUsize,
        last: Mutex<Option<QuerySpec>>,
    }

    impl QueryEngine for RecordingEngine {
        type Row = u64;

        fn fetch(&self, query: &QuerySpec) -> Result<Vec<u64>, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().expect("lock") = Some(query.clone());
            Ok(vec![1, 2])
        }

        fn paginate(&self, query: &QuerySpec, pagination: Pagination) -> Result<Page<u64>, EngineError> {
            let items = self.fetch(query)?;
            Ok(Page {
                total: items.len() as u64,
                items,
                page: pagination.page.get(),
                per_page: pagination.per_page.get(),
            })
        }
    }

    impl RecordingEngine {
        fn last_predicate(&self) -> Option<String> {
            self.last
                .lock()
                .expect("lock")
                .as_ref()
                .and_then(|query| query.predicate.as_ref().map(ToString::to_string))
        }
    }

    fn codec() -> Arc<OpaqueIdCodec> {
        Arc::new(
            OpaqueIdCodec::new(&CodecParams {
                salt: "repository tests".to_string(),
                ..CodecParams::default()
            })
            .expect("codec"),
        )
    }

    fn repository(cache: Option<CacheConfig>) -> (Repository<RecordingEngine>, Arc<RecordingEngine>) {
        let mut fields = BTreeMap::new();
        fields.insert("status".to_string(), FieldSpec::default());
        fields.insert("name".to_string(), FieldSpec::default());
        let schema = EntitySchema::compile("users", None, fields, BTreeMap::new()).expect("schema");
        let resolver = FieldResolver::new(
            Arc::new(schema),
            codec(),
            Arc::new(ResolutionPolicy::default()),
        );
        let engine = Arc::new(RecordingEngine::default());
        let mut repo = Repository::new(resolver, Arc::clone(&engine));
        if let Some(config) = cache {
            repo = repo.with_cache(Arc::new(CacheCoordinator::in_memory(config)));
        }
        (repo, engine)
    }

    fn status(value: &str) -> Criteria {
        Criteria::predicate(
            "status",
            PredicateNode::leaf(Condition::field(
                FieldPath::single("status"),
                OperatorKind::Eq,
                vec![Value::text(value)],
            )),
        )
    }

    #[test]
    fn criteria_apply_in_push_order_before_request() {
        let (mut repo, engine) = repository(None);
        repo.push_criteria(status("active"));
        let params = QueryParams::from_pairs([("filter", "name:jo")]);
        repo.query()
            .push(status("verified"))
            .request(&params)
            .expect("request")
            .all()
            .expect("all");

        assert_eq!(
            engine.last_predicate().as_deref(),
            Some(r#"(status = "active" AND status = "verified" AND name = "jo")"#)
        );
    }

    #[test]
    fn skip_criteria_is_consumed_by_one_operation() {
        let (mut repo, engine) = repository(None);
        repo.push_criteria(status("active"));
        repo.skip_criteria(true);

        repo.query().all().expect("all");
        assert_eq!(engine.last_predicate(), None);

        repo.query().all().expect("all");
        assert_eq!(engine.last_predicate().as_deref(), Some(r#"status = "active""#));
    }

    #[test]
    fn planning_leaves_the_skip_flag_for_the_next_operation() {
        let (mut repo, engine) = repository(None);
        repo.push_criteria(status("active"));
        repo.skip_criteria(true);

        let plan = repo.query().plan(CacheOperation::All);
        assert_eq!(plan.predicate, None);
        assert!(repo.criteria().is_skipping());

        repo.query().all().expect("all");
        assert_eq!(engine.last_predicate(), None);
        assert!(!repo.criteria().is_skipping());
    }

    #[test]
    fn request_criterion_takes_a_place_in_the_applied_stack() {
        let (mut repo, _) = repository(None);
        let stacked = repo.push_criteria(status("active"));
        let params = QueryParams::from_pairs([("filter", "name:jo")]);

        let plan = repo
            .query()
            .request(&params)
            .expect("request")
            .plan(CacheOperation::All);
        assert_eq!(plan.criteria.len(), 2);
        assert_eq!(plan.criteria[0], stacked);
        assert_ne!(plan.criteria[1], stacked);

        let bare = repo.query().plan(CacheOperation::All);
        assert_eq!(bare.criteria, [stacked]);
    }

    #[test]
    fn popped_criteria_no_longer_apply() {
        let (mut repo, engine) = repository(None);
        let id = repo.push_criteria(status("active"));
        repo.pop_criteria(id);
        repo.query().all().expect("all");
        assert_eq!(engine.last_predicate(), None);
    }

    #[test]
    fn find_adds_primary_key_condition() {
        let (mut repo, engine) = repository(None);
        let row = repo.query().find(7).expect("find");
        assert_eq!(row, Some(1));
        assert_eq!(engine.last_predicate().as_deref(), Some("id = 7"));
    }

    #[test]
    fn find_token_rejects_undecodable_tokens() {
        let (mut repo, engine) = repository(None);
        let err = repo.query().find_token("!!").expect_err("bad token");
        assert!(matches!(
            err,
            QueryError::Request(RequestError::IdentifierDecode { .. })
        ));
        assert_eq!(engine.calls.load(Ordering::SeqCst), 0);

        let token = codec().encode(9);
        repo.query().find_token(&token).expect("find");
        assert_eq!(engine.last_predicate().as_deref(), Some("id = 9"));
    }

    #[test]
    fn cached_reads_skip_the_engine() {
        let (mut repo, engine) = repository(Some(CacheConfig::default()));
        repo.query().all().expect("all");
        repo.query().all().expect("all");
        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);

        repo.query().skip_cache(true).all().expect("all");
        assert_eq!(engine.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn write_events_purge_cached_lists() {
        let (mut repo, engine) = repository(Some(CacheConfig::default()));
        repo.query().all().expect("all");
        repo.on_write(&InvalidationEvent::created("users", 3));
        repo.query().all().expect("all");
        assert_eq!(engine.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn plan_reports_cache_identity() {
        let (mut repo, _) = repository(Some(CacheConfig::default()));
        let plan = repo.query().plan(CacheOperation::Find(42));
        assert!(plan.cached);
        assert_eq!(plan.cache_tags.iter().collect::<Vec<_>>(), ["users", "users:42"]);
        assert_eq!(plan.predicate.as_deref(), Some("id = 42"));

        let uncached = repo.query().skip_cache(true).plan(CacheOperation::All);
        assert!(!uncached.cached);
        assert!(uncached.cache_key.is_none());
    }
}
