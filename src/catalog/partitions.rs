/// Key layout for catalog partitions
///
/// - `channels`: ch:{channel_id} -> Channel (JSON)
/// - `episodes`: ep:{episode_id} -> Episode (JSON)
/// - `episode_slugs`: slug:{channel_id}:{slug} -> episode_id
/// - `jobs`: job:{job_id} -> Job (JSON)
/// - `job_episodes`: jobep:{episode_id}:{job_id} -> empty
/// - `metadata`: meta:{key} -> value

pub fn encode_channel_key(channel_id: &str) -> Vec<u8> {
    format!("ch:{}", channel_id).into_bytes()
}

pub fn encode_episode_key(episode_id: &str) -> Vec<u8> {
    format!("ep:{}", episode_id).into_bytes()
}

pub fn encode_slug_key(channel_id: &str, slug: &str) -> Vec<u8> {
    format!("slug:{}:{}", channel_id, slug).into_bytes()
}

pub fn encode_job_key(job_id: &str) -> Vec<u8> {
    format!("job:{}", job_id).into_bytes()
}

pub fn encode_job_episode_key(episode_id: &str, job_id: &str) -> Vec<u8> {
    format!("jobep:{}:{}", episode_id, job_id).into_bytes()
}

/// Prefix for scanning every job of one episode
pub fn encode_job_episode_prefix(episode_id: &str) -> Vec<u8> {
    format!("jobep:{}:", episode_id).into_bytes()
}

/// jobep:{episode_id}:{job_id} -> job_id
///
/// Episode ids never contain ':' so the job id is everything after the second separator.
pub fn decode_job_episode_key(key: &[u8]) -> Option<String> {
    let key_str = std::str::from_utf8(key).ok()?;
    let rest = key_str.strip_prefix("jobep:")?;
    let (_, job_id) = rest.split_once(':')?;
    Some(job_id.to_string())
}

pub fn encode_meta_key(key: &str) -> Vec<u8> {
    format!("meta:{}", key).into_bytes()
}
