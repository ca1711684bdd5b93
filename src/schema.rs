//! Default engine schema for the sentiment-analytics workload.
//!
//! Statements are written in the engine dialect and must be idempotent, since
//! [`AnalyticsService::initialize`](crate::AnalyticsService::initialize) runs
//! them on every start.

/// Tables and indexes created when the engine comes up.
pub const ANALYTICS_SCHEMA: &[&str] = &[
   "CREATE TABLE IF NOT EXISTS sentiment_analytics (
      id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
      source VARCHAR NOT NULL,
      source_id VARCHAR,
      sentiment_score DOUBLE NOT NULL,
      sentiment_label VARCHAR NOT NULL,
      confidence DOUBLE,
      word_count BIGINT,
      model VARCHAR,
      analyzed_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
   )",
   "CREATE INDEX IF NOT EXISTS idx_sentiment_analytics_analyzed_at ON sentiment_analytics (analyzed_at)",
   "CREATE INDEX IF NOT EXISTS idx_sentiment_analytics_source ON sentiment_analytics (source, source_id)",
   "CREATE INDEX IF NOT EXISTS idx_sentiment_analytics_label ON sentiment_analytics (sentiment_label)",
];
