//! Admin-DM copy in both interface languages.

use opora_core::types::Lang;

pub fn welcome(lang: Lang) -> &'static str {
    match lang {
        Lang::Uk => "Вітаю! Я бот технічної підтримки. Напишіть назву групи, яку ви адмініструєте, і я підключуся до неї.",
        Lang::En => "Hi! I'm a tech-support bot. Send me the name of a group you administer and I'll attach to it.",
    }
}

pub fn group_not_found(lang: Lang) -> &'static str {
    match lang {
        Lang::Uk => "Не знайшов групу з такою назвою серед доступних мені. Перевірте назву і спробуйте ще раз.",
        Lang::En => "I couldn't find a group with that name among the ones I can reach. Check the name and try again.",
    }
}

pub fn qr_pending(lang: Lang) -> &'static str {
    match lang {
        Lang::Uk => "Групу знайдено. Готую QR-код для імпорту історії — надішлю його сюди за хвилину.",
        Lang::En => "Group found. Preparing a QR code for the history import — I'll send it here in a minute.",
    }
}

pub fn qr_ready(lang: Lang) -> &'static str {
    match lang {
        Lang::Uk => "Відскануйте цей QR-код другим акаунтом, щоб імпортувати історію групи.",
        Lang::En => "Scan this QR code with the secondary account to import the group history.",
    }
}

pub fn lang_set(lang: Lang) -> &'static str {
    match lang {
        Lang::Uk => "Мову переключено на українську.",
        Lang::En => "Language switched to English.",
    }
}

pub fn wiped(lang: Lang) -> &'static str {
    match lang {
        Lang::Uk => "Усі ваші дані видалено.",
        Lang::En => "All your data has been removed.",
    }
}

pub fn bootstrap_done(lang: Lang, count: usize) -> String {
    match lang {
        Lang::Uk => format!("Імпорт історії завершено: додано {count} кейсів."),
        Lang::En => format!("History import finished: {count} cases added."),
    }
}
