//! Prompt templates for the storyteller nodes.
//!
//! Templates are tera sources rendered with explicit contexts. Each
//! carries a version constant that participates in cache keys and
//! narration identity, so editing a template invalidates exactly the
//! calls that depend on it.

use serde_json::Value;
use tera::{Context, Tera};

pub const ENTITY_PROMPT_VERSION: &str = "v2-entity";
pub const NARRATION_PROMPT_VERSION: &str = "v2-narration";
pub const REFINE_PROMPT_VERSION: &str = "v2-refine";
pub const STEP_NARRATION_PROMPT_VERSION: &str = "v2-step-aggregate";

const ENTITY_SYSTEM: &str = "你是一个严谨的命名实体抽取器。只输出严格有效 JSON，不要输出 markdown，不要输出解释。";

const ENTITY_USER: &str = r#"语言：{{ language }}
请从以下章节文本中提取：人物、地点、道具/法宝、关键术语。
同义词或别名请保留原文写法，不要臆造。
输出字段要求：
- characters: string[]
- locations: string[]
- items: string[]
- key_phrases: string[]
仅输出 JSON：{% raw %}{"characters": [], "locations": [], "items": [], "key_phrases": []}{% endraw %}

<chapter_text>
{{ chapter_text }}
</chapter_text>
"#;

const NARRATION_SYSTEM: &str = r#"你是一位资深评书艺人/剧情解说作者。你的目标不是压缩，而是重写：在不偏离原文事实的前提下，生成沉浸感强的说书稿。只输出严格有效 JSON 对象，不要输出 markdown，不要输出解释。"#;

const NARRATION_USER: &str = r#"语言：{{ language }}
风格：{{ style }}
说书稿长度约为原文的 {{ ratio_low }} ~ {{ ratio_high }} 倍。
保留关键对白：{{ include_key_dialogue }}
保留心理描写：{{ include_inner_thoughts }}

世界观状态（硬约束，不可违背）：
人物状态：{{ character_states }}
道具状态：{{ item_states }}
近期事件：{{ recent_events }}
唤醒前情（软约束）：{{ awakened_memories }}

章节标题：{{ chapter_title }}
章节原文：
<chapter_text>
{{ chapter_text }}
</chapter_text>

输出 JSON schema（单个对象）：
{% raw %}{
  "narration": "string",
  "key_events": [{"who":"string","what":"string","where":"string","outcome":"string","impact":"string"}],
  "character_updates": [{"name":"string","change_type":"status|location|ability|relationship","before":"string","after":"string","evidence":"string"}],
  "new_items": [{"name":"string","owner":"string","description":"string"}]
}{% endraw %}
"#;

const REFINE_SYSTEM: &str = "你是一位小说叙事润色编辑。请在不改变事实的前提下，优化叙事连贯性、节奏和文风统一性。只输出严格 JSON，不要输出 markdown。";

const REFINE_USER: &str = r#"语言：{{ language }}
目标风格：{{ style }}

你会收到初稿和结构化约束，请仅做润色，不新增虚构事实。
关键事件（不可丢失）：
{{ key_events }}

人物更新（不可丢失）：
{{ character_updates }}

初稿：
{{ draft_narration }}

输出 JSON schema：
{% raw %}{
  "narration": "string"
}{% endraw %}
"#;

const STEP_NARRATION_SYSTEM: &str = "你是一位资深评书艺人/剧情解说作者。你的目标不是压缩，而是重写：在不偏离事实的前提下，对一个章节区间进行整体重写。你将一次处理多个章节，但只能输出一个聚合结果，且遵守同一份世界观硬约束。只输出严格有效 JSON 对象，不要输出 markdown，不要输出解释。";

const STEP_NARRATION_USER: &str = r#"语言：{{ language }}
风格：{{ style }}

你会收到：
- 区间基准世界观状态（硬约束，所有章节共享）
- 多个章节的原文与该章的唤醒前情（软约束）

区间范围：第 {{ step_start }} 章 到 第 {{ step_end }} 章。
请输出一个区间级说书稿（不要逐章拆分输出）。

区间基准世界观状态（硬约束，所有章节共享）：
{{ base_world_state }}

chapters（用于汇总，不要引用区间范围外的未来信息）：
{{ chapters }}

输出 JSON schema（单个对象）：
{% raw %}{
  "step_start_chapter_idx": 1,
  "step_end_chapter_idx": 8,
  "narration": "string",
  "key_events": [{"who":"string","what":"string","where":"string","outcome":"string","impact":"string"}],
  "character_updates": [{"name":"string","change_type":"status|location|ability|relationship","before":"string","after":"string","evidence":"string"}],
  "new_items": [{"name":"string","owner":"string","description":"string"}]
}{% endraw %}
"#;

fn render(template: &str, context: &Context) -> Result<String, tera::Error> {
    Tera::one_off(template, context, false)
}

fn json_string(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

pub fn entity_prompt(language: &str, chapter_text: &str) -> Result<(String, String), tera::Error> {
    let mut context = Context::new();
    context.insert("language", language);
    context.insert("chapter_text", chapter_text);
    Ok((ENTITY_SYSTEM.to_string(), render(ENTITY_USER, &context)?))
}

#[allow(clippy::too_many_arguments)]
pub fn narration_prompt(
    language: &str,
    style: &str,
    narration_ratio: (f64, f64),
    include_key_dialogue: bool,
    include_inner_thoughts: bool,
    chapter_title: &str,
    chapter_text: &str,
    character_states: &Value,
    item_states: &Value,
    recent_events: &Value,
    awakened_memories: &Value,
) -> Result<(String, String), tera::Error> {
    let mut context = Context::new();
    context.insert("language", language);
    context.insert("style", style);
    context.insert("ratio_low", &format!("{:.2}", narration_ratio.0));
    context.insert("ratio_high", &format!("{:.2}", narration_ratio.1));
    context.insert("include_key_dialogue", &include_key_dialogue);
    context.insert("include_inner_thoughts", &include_inner_thoughts);
    context.insert("chapter_title", chapter_title);
    context.insert("chapter_text", chapter_text);
    context.insert("character_states", &json_string(character_states));
    context.insert("item_states", &json_string(item_states));
    context.insert("recent_events", &json_string(recent_events));
    context.insert("awakened_memories", &json_string(awakened_memories));
    Ok((NARRATION_SYSTEM.to_string(), render(NARRATION_USER, &context)?))
}

pub fn refine_prompt(
    language: &str,
    style: &str,
    key_events: &Value,
    character_updates: &Value,
    draft_narration: &str,
) -> Result<(String, String), tera::Error> {
    let mut context = Context::new();
    context.insert("language", language);
    context.insert("style", style);
    context.insert("key_events", &json_string(key_events));
    context.insert("character_updates", &json_string(character_updates));
    context.insert("draft_narration", draft_narration);
    Ok((REFINE_SYSTEM.to_string(), render(REFINE_USER, &context)?))
}

pub fn step_narration_prompt(
    language: &str,
    style: &str,
    step_start: i64,
    step_end: i64,
    base_world_state: &Value,
    chapters: &Value,
) -> Result<(String, String), tera::Error> {
    let mut context = Context::new();
    context.insert("language", language);
    context.insert("style", style);
    context.insert("step_start", &step_start);
    context.insert("step_end", &step_end);
    context.insert("base_world_state", &json_string(base_world_state));
    context.insert("chapters", &json_string(chapters));
    Ok((
        STEP_NARRATION_SYSTEM.to_string(),
        render(STEP_NARRATION_USER, &context)?,
    ))
}
