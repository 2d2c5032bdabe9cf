use crate::record::{
    AuthenticationRecord, CommentRecord, CredentialsRecord, FullPostRecord, ImageRecord,
    UserRecord,
};
use safefeed_common::{
    model::{
        Id, ModelValidationError, SafefeedSnowflake, SafefeedSnowflakeGenerator,
        auth::{Authentication, AuthTokenHash, PasswordHash},
        comment::{Comment, CommentMarker, CreateComment},
        like::LikeState,
        post::{CreatePost, FeedPost, Post, PostImage, PostMarker},
        user::{CreateUser, User, UserHandle, UserMarker},
    },
    snowflake::{ProcessId, WorkerId},
};
use sqlx::{
    QueryBuilder, Sqlite, SqlitePool, query, query_as, query_scalar,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{
    collections::HashMap,
    str::FromStr,
    sync::{Mutex, PoisonError},
};
use thiserror::Error;
use tracing::debug;

pub type Result<T, E = DbError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("An object in the database was invalid: {0}")]
    Data(#[from] ModelValidationError),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("Running migrations failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("The handle {0} is already taken")]
    HandleTaken(UserHandle),
}

const FULL_POST_SELECT: &str = "
    SELECT
        posts.post_snowflake,
        posts.content,
        posts.image IS NOT NULL AS has_image,
        users.user_snowflake,
        users.handle,
        (
            SELECT COUNT(*) FROM likes WHERE likes.post_snowflake = posts.post_snowflake
        ) AS like_count
    FROM
        posts JOIN users ON posts.user_snowflake = users.user_snowflake
    ";

/// Post ids bound per comment query, well below SQLite's bind parameter limit.
const COMMENT_FETCH_CHUNK_SIZE: usize = 500;

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|db_err| db_err.is_unique_violation())
}

fn count_from_db(count: i64) -> u64 {
    count.cast_unsigned()
}

pub struct DbClient {
    pool: SqlitePool,
    snowflake_generator: Mutex<SafefeedSnowflakeGenerator>,
}

impl DbClient {
    #[must_use]
    pub fn new(pool: SqlitePool, worker_id: WorkerId, process_id: ProcessId) -> Self {
        let snowflake_generator =
            Mutex::new(SafefeedSnowflakeGenerator::new(worker_id, process_id));

        Self {
            pool,
            snowflake_generator,
        }
    }

    /// Opens (creating if needed) the database at `database_url` and runs migrations.
    pub async fn connect(
        database_url: &str,
        worker_id: WorkerId,
        process_id: ProcessId,
    ) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        // Every connection to an in-memory database sees its own empty database.
        let pool_options = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new()
        };
        let pool = pool_options.connect_with(options).await?;

        let client = Self::new(pool, worker_id, process_id);
        client.migrate().await?;
        Ok(client)
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    fn next_snowflake(&self) -> SafefeedSnowflake {
        self.snowflake_generator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .generate()
    }

    pub async fn fetch_user(&self, user_id: Id<UserMarker>) -> Result<Option<User>> {
        let record = query_as::<_, UserRecord>(
            "
            SELECT user_snowflake, handle
            FROM users
            WHERE user_snowflake = ?1
            ",
        )
        .bind(user_id.to_db())
        .fetch_optional(&self.pool)
        .await?;

        let user = record.map(User::try_from).transpose()?;
        Ok(user)
    }

    pub async fn fetch_user_by_handle(&self, handle: &UserHandle) -> Result<Option<User>> {
        let record = query_as::<_, UserRecord>(
            "
            SELECT user_snowflake, handle
            FROM users
            WHERE handle = ?1
            ",
        )
        .bind(handle.get())
        .fetch_optional(&self.pool)
        .await?;

        let user = record.map(User::try_from).transpose()?;
        Ok(user)
    }

    pub async fn fetch_credentials(
        &self,
        handle: &UserHandle,
    ) -> Result<Option<(User, PasswordHash)>> {
        let record = query_as::<_, CredentialsRecord>(
            "
            SELECT user_snowflake, handle, password_hash
            FROM users
            WHERE handle = ?1
            ",
        )
        .bind(handle.get())
        .fetch_optional(&self.pool)
        .await?;

        let credentials = record.map(<(User, PasswordHash)>::try_from).transpose()?;
        Ok(credentials)
    }

    pub async fn create_user(&self, user: &CreateUser) -> Result<Id<UserMarker>> {
        let user_snowflake = self.next_snowflake();

        let returned_snowflake = query_scalar::<_, i64>(
            "
            INSERT INTO users (user_snowflake, handle, password_hash)
            VALUES (?1, ?2, ?3)
            RETURNING user_snowflake
            ",
        )
        .bind(user_snowflake.get().cast_signed())
        .bind(user.handle.get())
        .bind(user.password_hash.as_phc_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                DbError::HandleTaken(user.handle.clone())
            } else {
                err.into()
            }
        })?;

        debug!(user_snowflake = returned_snowflake, handle = %user.handle, "Created user");
        Ok(Id::from_db(returned_snowflake))
    }

    /// Returns `false` if the user does not exist.
    pub async fn update_handle(&self, user_id: Id<UserMarker>, handle: &UserHandle) -> Result<bool> {
        let result = query("UPDATE users SET handle = ?1 WHERE user_snowflake = ?2")
            .bind(handle.get())
            .bind(user_id.to_db())
            .execute(&self.pool)
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    DbError::HandleTaken(handle.clone())
                } else {
                    err.into()
                }
            })?;

        Ok(result.rows_affected() == 1)
    }

    /// Case-insensitive substring search on handles, ordered by handle.
    pub async fn search_users(&self, search: &str) -> Result<Vec<User>> {
        let records = query_as::<_, UserRecord>(
            "
            SELECT user_snowflake, handle
            FROM users
            WHERE instr(lower(handle), lower(?1)) > 0
            ORDER BY handle
            ",
        )
        .bind(search)
        .fetch_all(&self.pool)
        .await?;

        let users = records
            .into_iter()
            .map(User::try_from)
            .collect::<Result<_, _>>()?;
        Ok(users)
    }

    pub async fn create_auth(&self, authentication: &Authentication) -> Result<()> {
        query(
            "
            INSERT INTO authentications (token_hash, user_snowflake, created_at, expires_after_seconds)
            VALUES (?1, ?2, ?3, ?4)
            ",
        )
        .bind(authentication.token_hash.0.as_slice())
        .bind(authentication.user.to_db())
        .bind(authentication.created_at)
        .bind(
            authentication
                .expires_after
                .map(|expires_after| expires_after.whole_seconds()),
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn fetch_auth(&self, token_hash: &AuthTokenHash) -> Result<Option<Authentication>> {
        let record = query_as::<_, AuthenticationRecord>(
            "
            SELECT user_snowflake, token_hash, created_at, expires_after_seconds
            FROM authentications
            WHERE token_hash = ?1
            ",
        )
        .bind(token_hash.0.as_slice())
        .fetch_optional(&self.pool)
        .await?;

        let authentication = record.map(Authentication::try_from).transpose()?;
        Ok(authentication)
    }

    /// Returns `false` if no such authentication existed.
    pub async fn delete_auth(&self, token_hash: &AuthTokenHash) -> Result<bool> {
        let result = query("DELETE FROM authentications WHERE token_hash = ?1")
            .bind(token_hash.0.as_slice())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn create_post(&self, post: &CreatePost) -> Result<Id<PostMarker>> {
        let post_snowflake = self.next_snowflake();

        let returned_snowflake = query_scalar::<_, i64>(
            "
            INSERT INTO posts (post_snowflake, user_snowflake, content, image, image_content_type)
            VALUES (?1, ?2, ?3, ?4, ?5)
            RETURNING post_snowflake
            ",
        )
        .bind(post_snowflake.get().cast_signed())
        .bind(post.author.to_db())
        .bind(post.content.get())
        .bind(post.image.as_ref().map(|image| image.bytes.as_slice()))
        .bind(post.image.as_ref().map(|image| image.content_type.as_str()))
        .fetch_one(&self.pool)
        .await?;

        debug!(
            post_snowflake = returned_snowflake,
            author = %post.author,
            has_image = post.image.is_some(),
            "Created post"
        );
        Ok(Id::from_db(returned_snowflake))
    }

    pub async fn fetch_post(&self, post_id: Id<PostMarker>) -> Result<Option<FeedPost>> {
        let record = query_as::<_, FullPostRecord>(&format!(
            "{FULL_POST_SELECT} WHERE posts.post_snowflake = ?1"
        ))
        .bind(post_id.to_db())
        .fetch_optional(&self.pool)
        .await?;

        let posts = self.assemble_feed_posts(record.into_iter().collect()).await?;
        Ok(posts.into_iter().next())
    }

    /// `None` if the post does not exist or has no image.
    pub async fn fetch_post_image(&self, post_id: Id<PostMarker>) -> Result<Option<PostImage>> {
        let record = query_as::<_, ImageRecord>(
            "
            SELECT image, image_content_type
            FROM posts
            WHERE post_snowflake = ?1 AND image IS NOT NULL
            ",
        )
        .bind(post_id.to_db())
        .fetch_optional(&self.pool)
        .await?;

        Ok(record.map(PostImage::from))
    }

    /// Deletes the post only if `author` wrote it. Returns whether a post was deleted.
    pub async fn delete_post(
        &self,
        post_id: Id<PostMarker>,
        author: Id<UserMarker>,
    ) -> Result<bool> {
        let result = query("DELETE FROM posts WHERE post_snowflake = ?1 AND user_snowflake = ?2")
            .bind(post_id.to_db())
            .bind(author.to_db())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    /// All posts, most recent first.
    pub async fn fetch_feed(&self) -> Result<Vec<FeedPost>> {
        let records = query_as::<_, FullPostRecord>(&format!(
            "{FULL_POST_SELECT} ORDER BY posts.post_snowflake DESC"
        ))
        .fetch_all(&self.pool)
        .await?;

        self.assemble_feed_posts(records).await
    }

    pub async fn fetch_user_posts(&self, user_id: Id<UserMarker>) -> Result<Vec<FeedPost>> {
        let records = query_as::<_, FullPostRecord>(&format!(
            "{FULL_POST_SELECT} WHERE posts.user_snowflake = ?1 ORDER BY posts.post_snowflake DESC"
        ))
        .bind(user_id.to_db())
        .fetch_all(&self.pool)
        .await?;

        self.assemble_feed_posts(records).await
    }

    /// Posts liked by `user_id`, most recently liked first.
    pub async fn fetch_liked_posts(&self, user_id: Id<UserMarker>) -> Result<Vec<FeedPost>> {
        let records = query_as::<_, FullPostRecord>(&format!(
            "
            {FULL_POST_SELECT}
                JOIN likes AS liked ON liked.post_snowflake = posts.post_snowflake
            WHERE liked.user_snowflake = ?1
            ORDER BY liked.like_snowflake DESC
            "
        ))
        .bind(user_id.to_db())
        .fetch_all(&self.pool)
        .await?;

        self.assemble_feed_posts(records).await
    }

    async fn assemble_feed_posts(&self, records: Vec<FullPostRecord>) -> Result<Vec<FeedPost>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let mut comments_by_post: HashMap<Id<PostMarker>, Vec<Comment>> = HashMap::new();
        for chunk in records.chunks(COMMENT_FETCH_CHUNK_SIZE) {
            let mut builder = QueryBuilder::<Sqlite>::new(
                "
                SELECT
                    comments.comment_snowflake,
                    comments.post_snowflake,
                    comments.content,
                    users.user_snowflake,
                    users.handle
                FROM
                    comments JOIN users ON comments.user_snowflake = users.user_snowflake
                WHERE comments.post_snowflake IN (",
            );
            let mut separated = builder.separated(", ");
            for record in chunk {
                separated.push_bind(record.post_snowflake);
            }
            separated.push_unseparated(") ORDER BY comments.comment_snowflake ASC");

            let comment_records = builder
                .build_query_as::<CommentRecord>()
                .fetch_all(&self.pool)
                .await?;

            for comment_record in comment_records {
                let comment = Comment::try_from(comment_record)?;
                comments_by_post
                    .entry(comment.post_id)
                    .or_default()
                    .push(comment);
            }
        }

        records
            .into_iter()
            .map(|record| {
                let like_count = count_from_db(record.like_count);
                let post = Post::try_from(record)?;
                let comments = comments_by_post.remove(&post.id).unwrap_or_default();

                Ok(FeedPost {
                    post,
                    like_count,
                    comments,
                })
            })
            .collect()
    }

    /// `None` if the post does not exist.
    pub async fn create_comment(
        &self,
        comment: &CreateComment,
    ) -> Result<Option<Id<CommentMarker>>> {
        let comment_snowflake = self.next_snowflake();

        let returned_snowflake = query_scalar::<_, i64>(
            "
            INSERT INTO comments (comment_snowflake, post_snowflake, user_snowflake, content)
            SELECT ?1, post_snowflake, ?3, ?4
            FROM posts
            WHERE post_snowflake = ?2
            RETURNING comment_snowflake
            ",
        )
        .bind(comment_snowflake.get().cast_signed())
        .bind(comment.post_id.to_db())
        .bind(comment.author.to_db())
        .bind(comment.content.get())
        .fetch_optional(&self.pool)
        .await?;

        Ok(returned_snowflake.map(Id::from_db))
    }

    /// Deletes the comment only if `author` wrote it. Returns whether a comment was deleted.
    pub async fn delete_comment(
        &self,
        comment_id: Id<CommentMarker>,
        author: Id<UserMarker>,
    ) -> Result<bool> {
        let result =
            query("DELETE FROM comments WHERE comment_snowflake = ?1 AND user_snowflake = ?2")
                .bind(comment_id.to_db())
                .bind(author.to_db())
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Likes the post for `user_id`, or removes the like if it already existed.
    ///
    /// `None` if the post does not exist.
    pub async fn toggle_like(
        &self,
        post_id: Id<PostMarker>,
        user_id: Id<UserMarker>,
    ) -> Result<Option<LikeState>> {
        let like_snowflake = self.next_snowflake();
        // Writer lock up front so concurrent toggles wait on the busy timeout.
        let mut transaction = self.pool.begin_with("BEGIN IMMEDIATE").await?;

        let post_exists = query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM posts WHERE post_snowflake = ?1)",
        )
        .bind(post_id.to_db())
        .fetch_one(&mut *transaction)
        .await?;
        if !post_exists {
            return Ok(None);
        }

        let removed = query("DELETE FROM likes WHERE post_snowflake = ?1 AND user_snowflake = ?2")
            .bind(post_id.to_db())
            .bind(user_id.to_db())
            .execute(&mut *transaction)
            .await?
            .rows_affected()
            > 0;

        if !removed {
            query(
                "
                INSERT INTO likes (like_snowflake, post_snowflake, user_snowflake)
                VALUES (?1, ?2, ?3)
                ON CONFLICT (user_snowflake, post_snowflake) DO NOTHING
                ",
            )
            .bind(like_snowflake.get().cast_signed())
            .bind(post_id.to_db())
            .bind(user_id.to_db())
            .execute(&mut *transaction)
            .await?;
        }

        let count = query_scalar::<_, i64>("SELECT COUNT(*) FROM likes WHERE post_snowflake = ?1")
            .bind(post_id.to_db())
            .fetch_one(&mut *transaction)
            .await?;

        transaction.commit().await?;

        Ok(Some(LikeState {
            post_id,
            user_id,
            liked: !removed,
            like_count: count_from_db(count),
        }))
    }
}
