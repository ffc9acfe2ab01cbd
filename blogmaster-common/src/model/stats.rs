use crate::util::number_or_string;
use serde::{Deserialize, Serialize};

/// Aggregate returned by the `get_blog_stats` procedure.
#[derive(Copy, Clone, PartialEq, Debug, Default, Deserialize, Serialize)]
pub struct Stats {
    #[serde(deserialize_with = "number_or_string")]
    pub total_posts: u64,
    #[serde(deserialize_with = "number_or_string")]
    pub avg_comments_per_post: f64,
    #[serde(deserialize_with = "number_or_string")]
    pub avg_posts_per_user: f64,
}

#[cfg(test)]
mod tests {
    use crate::model::stats::Stats;
    use serde_json::json;

    #[test]
    fn numeric_columns_may_be_strings() {
        let stats: Stats = serde_json::from_value(json!({
            "total_posts": 12,
            "avg_comments_per_post": "2.5000000000000000",
            "avg_posts_per_user": 3,
        }))
        .unwrap();

        assert_eq!(stats.total_posts, 12);
        assert!((stats.avg_comments_per_post - 2.5).abs() < f64::EPSILON);
        assert!((stats.avg_posts_per_user - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_blog_averages_are_zero() {
        let stats: Stats = serde_json::from_value(json!({
            "total_posts": 0,
            "avg_comments_per_post": null,
            "avg_posts_per_user": null,
        }))
        .unwrap();

        assert_eq!(stats, Stats::default());
    }

    #[test]
    fn garbage_is_rejected() {
        let result = serde_json::from_value::<Stats>(json!({
            "total_posts": "many",
            "avg_comments_per_post": 1.0,
            "avg_posts_per_user": 1.0,
        }));

        assert!(result.is_err());
    }
}
